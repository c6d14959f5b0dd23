//! Command vocabulary shared by every transport.
//!
//! Commands travel as a name plus positional JSON arguments, the same shape
//! the relay carries. [`Call::parse`] turns that into a typed request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_wire::{BreakpointId, FrameLevel, StepCommand, ThreadId};

use crate::error::{Result, SessionError};

/// Result fields of a command, as delivered to callers on every transport.
pub type Envelope = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    ListThreadIds,
    GetThreadInfo,
    SuspendThread,
    ResumeThread,
    GetThreadStack,
    GetFrameLocals,
    GetSourceFile,
    SetBreakpoint,
    EnableBreakpoint,
    DisableBreakpoint,
    DeleteBreakpoint,
    SetBreakpointCondition,
    SetBreakpointConditionalEnabled,
    GetBreakpoints,
    Evaluate,
    Step,
}

impl Command {
    pub const ALL: [Command; 16] = [
        Self::ListThreadIds,
        Self::GetThreadInfo,
        Self::SuspendThread,
        Self::ResumeThread,
        Self::GetThreadStack,
        Self::GetFrameLocals,
        Self::GetSourceFile,
        Self::SetBreakpoint,
        Self::EnableBreakpoint,
        Self::DisableBreakpoint,
        Self::DeleteBreakpoint,
        Self::SetBreakpointCondition,
        Self::SetBreakpointConditionalEnabled,
        Self::GetBreakpoints,
        Self::Evaluate,
        Self::Step,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ListThreadIds => "listThreadIds",
            Self::GetThreadInfo => "getThreadInfo",
            Self::SuspendThread => "suspendThread",
            Self::ResumeThread => "resumeThread",
            Self::GetThreadStack => "getThreadStack",
            Self::GetFrameLocals => "getFrameLocals",
            Self::GetSourceFile => "getSourceFile",
            Self::SetBreakpoint => "setBreakpoint",
            Self::EnableBreakpoint => "enableBreakpoint",
            Self::DisableBreakpoint => "disableBreakpoint",
            Self::DeleteBreakpoint => "deleteBreakpoint",
            Self::SetBreakpointCondition => "setBreakpointCondition",
            Self::SetBreakpointConditionalEnabled => "setBreakpointConditionalEnabled",
            Self::GetBreakpoints => "getBreakpoints",
            Self::Evaluate => "evaluate",
            Self::Step => "step",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.name() == s)
            .ok_or_else(|| SessionError::UnknownCommand(s.to_string()))
    }
}

/// A command with its arguments decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListThreadIds,
    GetThreadInfo {
        thread_id: ThreadId,
    },
    SuspendThread {
        thread_id: ThreadId,
    },
    ResumeThread {
        thread_id: ThreadId,
    },
    GetThreadStack {
        thread_id: ThreadId,
    },
    GetFrameLocals {
        thread_id: ThreadId,
        level: FrameLevel,
    },
    GetSourceFile {
        method: String,
    },
    SetBreakpoint {
        method: String,
        line: Option<u32>,
        file: Option<String>,
    },
    EnableBreakpoint {
        id: BreakpointId,
    },
    DisableBreakpoint {
        id: BreakpointId,
    },
    DeleteBreakpoint {
        id: BreakpointId,
    },
    SetBreakpointCondition {
        id: BreakpointId,
        expression: String,
        expected: String,
    },
    SetBreakpointConditionalEnabled {
        id: BreakpointId,
        enabled: bool,
    },
    GetBreakpoints,
    Evaluate {
        thread_id: ThreadId,
        level: FrameLevel,
        expression: String,
    },
    Step {
        thread_id: ThreadId,
        step: StepCommand,
        count: u32,
    },
}

impl Call {
    pub fn parse(command: Command, args: &[Value]) -> Result<Self> {
        let mut args = Args::new(command, args);
        let call = match command {
            Command::ListThreadIds => Self::ListThreadIds,
            Command::GetThreadInfo => Self::GetThreadInfo {
                thread_id: args.u32("threadId")?,
            },
            Command::SuspendThread => Self::SuspendThread {
                thread_id: args.u32("threadId")?,
            },
            Command::ResumeThread => Self::ResumeThread {
                thread_id: args.u32("threadId")?,
            },
            Command::GetThreadStack => Self::GetThreadStack {
                thread_id: args.u32("threadId")?,
            },
            Command::GetFrameLocals => Self::GetFrameLocals {
                thread_id: args.u32("threadId")?,
                level: args.u32("frameLevel")?,
            },
            Command::GetSourceFile => Self::GetSourceFile {
                method: args.string("methodName")?,
            },
            Command::SetBreakpoint => Self::SetBreakpoint {
                method: args.string("methodName")?,
                line: args.opt_u32("line")?,
                file: args.opt_string("file")?,
            },
            Command::EnableBreakpoint => Self::EnableBreakpoint {
                id: args.u32("breakpointId")?,
            },
            Command::DisableBreakpoint => Self::DisableBreakpoint {
                id: args.u32("breakpointId")?,
            },
            Command::DeleteBreakpoint => Self::DeleteBreakpoint {
                id: args.u32("breakpointId")?,
            },
            Command::SetBreakpointCondition => Self::SetBreakpointCondition {
                id: args.u32("breakpointId")?,
                expression: args.string("expression")?,
                expected: args.string("expectedValue")?,
            },
            Command::SetBreakpointConditionalEnabled => Self::SetBreakpointConditionalEnabled {
                id: args.u32("breakpointId")?,
                enabled: args.bool("enabled")?,
            },
            Command::GetBreakpoints => Self::GetBreakpoints,
            Command::Evaluate => Self::Evaluate {
                thread_id: args.u32("threadId")?,
                level: args.u32("frameLevel")?,
                expression: args.string("expression")?,
            },
            Command::Step => Self::Step {
                thread_id: args.u32("threadId")?,
                step: args.step("kind")?,
                count: args.opt_u32("count")?.unwrap_or(1),
            },
        };
        args.finish()?;
        Ok(call)
    }
}

/// Positional argument cursor. Trailing `null`s count as omitted optionals.
struct Args<'a> {
    command: Command,
    values: &'a [Value],
    next: usize,
}

impl<'a> Args<'a> {
    fn new(command: Command, values: &'a [Value]) -> Self {
        Self {
            command,
            values,
            next: 0,
        }
    }

    fn bad(&self, message: String) -> SessionError {
        SessionError::BadArguments {
            command: self.command.name(),
            message,
        }
    }

    fn take(&mut self) -> Option<&'a Value> {
        let value = self.values.get(self.next);
        self.next += 1;
        value.filter(|v| !v.is_null())
    }

    fn required(&mut self, name: &str) -> Result<&'a Value> {
        self.take()
            .ok_or_else(|| self.bad(format!("missing `{name}`")))
    }

    fn u32_of(&self, name: &str, value: &Value) -> Result<u32> {
        value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| self.bad(format!("`{name}` must be an unsigned 32-bit integer, got {value}")))
    }

    fn u32(&mut self, name: &str) -> Result<u32> {
        let value = self.required(name)?;
        self.u32_of(name, value)
    }

    fn opt_u32(&mut self, name: &str) -> Result<Option<u32>> {
        match self.take() {
            Some(value) => self.u32_of(name, value).map(Some),
            None => Ok(None),
        }
    }

    fn string(&mut self, name: &str) -> Result<String> {
        let value = self.required(name)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.bad(format!("`{name}` must be a string, got {value}")))
    }

    fn opt_string(&mut self, name: &str) -> Result<Option<String>> {
        match self.take() {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.bad(format!("`{name}` must be a string, got {other}"))),
            None => Ok(None),
        }
    }

    fn bool(&mut self, name: &str) -> Result<bool> {
        let value = self.required(name)?;
        value
            .as_bool()
            .ok_or_else(|| self.bad(format!("`{name}` must be a boolean, got {value}")))
    }

    fn step(&mut self, name: &str) -> Result<StepCommand> {
        let kind = self.string(name)?;
        kind.parse().map_err(|err: String| self.bad(err))
    }

    fn finish(&self) -> Result<()> {
        let rest = self.values.get(self.next..).unwrap_or_default();
        let extra = rest.iter().filter(|v| !v.is_null()).count();
        if extra > 0 {
            return Err(self.bad(format!("{extra} unexpected trailing argument(s)")));
        }
        Ok(())
    }
}

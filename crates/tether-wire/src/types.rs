use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::ByteOrder;

pub type ThreadId = u32;
pub type BreakpointId = u32;
pub type FrameLevel = u32;

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("agent connection closed")]
    ConnectionClosed,
    #[error("handshake signature mismatch: {received:?}")]
    HandshakeMismatch { received: String },
    #[error("agent protocol error: {0}")]
    Protocol(String),
    #[error("agent error {code}: {message}")]
    Agent { code: u32, message: String },
    #[error("step already in progress")]
    StepInProgress,
    #[error("unknown breakpoint {0}")]
    UnknownBreakpoint(BreakpointId),
    #[error("timed out waiting for the agent")]
    Timeout,
}

impl AgentError {
    /// Transport- and protocol-fatal errors end the connection; everything
    /// else is scoped to one request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::HandshakeMismatch { .. } | Self::Protocol(_)
        )
    }
}

impl From<io::Error> for AgentError {
    fn from(err: io::Error) -> Self {
        AgentError::Io(err.to_string())
    }
}

/// Result of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub byte_order: ByteOrder,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameLanguage {
    /// Frames executing in the agent's host runtime.
    Host,
    /// Frames of the source language the debugger tracks.
    Tracked,
    Other(u32),
}

impl FrameLanguage {
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            0 => Self::Host,
            1 => Self::Tracked,
            other => Self::Other(other),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            Self::Host => 0,
            Self::Tracked => 1,
            Self::Other(tag) => tag,
        }
    }
}

/// Method name the agent reports for frames it cannot resolve.
pub const UNRESOLVED_FRAME_NAME: &str = "<unknown>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub level: FrameLevel,
    pub offset: u32,
    pub name: String,
    pub language: FrameLanguage,
}

impl Frame {
    pub fn identity(&self) -> FrameIdentity {
        FrameIdentity {
            name: self.name.clone(),
            offset: self.offset,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.name.is_empty() || self.name == UNRESOLVED_FRAME_NAME
    }

    /// Whether a long step may come to rest on this frame.
    pub fn is_stop_point(&self) -> bool {
        self.language == FrameLanguage::Tracked && self.offset != 0 && !self.is_synthetic()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameIdentity {
    pub name: String,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum LocalValue {
    Int(i32),
    Bool(bool),
    Double(f64),
    Float(f32),
    Str(String),
    Unknown { tag: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalVariable {
    pub name: String,
    pub is_argument: bool,
    pub is_invalid: bool,
    pub is_anonymous: bool,
    pub is_slot: bool,
    pub value: LocalValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ThreadState {
    New,
    Terminated,
    Runnable,
    Blocked,
    Waiting,
    ObjectWait,
    Parked,
    Sleeping,
    Unknown(u32),
}

impl ThreadState {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::New,
            1 => Self::Terminated,
            2 => Self::Runnable,
            3 => Self::Blocked,
            4 => Self::Waiting,
            5 => Self::ObjectWait,
            6 => Self::Parked,
            7 => Self::Sleeping,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::New => 0,
            Self::Terminated => 1,
            Self::Runnable => 2,
            Self::Blocked => 3,
            Self::Waiting => 4,
            Self::ObjectWait => 5,
            Self::Parked => 6,
            Self::Sleeping => 7,
            Self::Unknown(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadFlags {
    pub suspended: bool,
    pub interrupted: bool,
    pub native: bool,
}

impl ThreadFlags {
    pub const SUSPENDED: u32 = 1;
    pub const INTERRUPTED: u32 = 2;
    pub const NATIVE: u32 = 4;

    pub fn from_bits(bits: u32) -> Self {
        Self {
            suspended: bits & Self::SUSPENDED != 0,
            interrupted: bits & Self::INTERRUPTED != 0,
            native: bits & Self::NATIVE != 0,
        }
    }

    pub fn bits(self) -> u32 {
        (self.suspended as u32 * Self::SUSPENDED)
            | (self.interrupted as u32 * Self::INTERRUPTED)
            | (self.native as u32 * Self::NATIVE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    pub priority: u32,
    pub is_daemon: bool,
    pub state: ThreadState,
    pub name: String,
    pub flags: ThreadFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakpointKind {
    MethodEntry,
    Line,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointCondition {
    pub expression: String,
    /// Stringified evaluation result that makes the breakpoint stop.
    pub expected: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub kind: BreakpointKind,
    pub method: String,
    pub line: Option<u32>,
    pub file: Option<String>,
    pub enabled: bool,
    pub conditional: bool,
    pub condition: Option<BreakpointCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointEvent {
    pub breakpoint_id: BreakpointId,
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ThreadEventKind {
    Started,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEvent {
    pub kind: ThreadEventKind,
    pub thread_id: ThreadId,
}

//! Client-side breakpoint metadata and conditional-hit evaluation.

use std::collections::BTreeMap;
use std::future::Future;

use crate::types::{
    AgentError, Breakpoint, BreakpointCondition, BreakpointEvent, BreakpointId, BreakpointKind,
    FrameLevel, Result, ThreadId,
};

/// Frame conditions are evaluated in: the halted frame itself.
pub const CONDITION_FRAME: FrameLevel = 0;

impl Breakpoint {
    pub fn new(id: BreakpointId, method: String, line: Option<u32>, file: Option<String>) -> Self {
        Self {
            id,
            kind: if line.is_some() {
                BreakpointKind::Line
            } else {
                BreakpointKind::MethodEntry
            },
            method,
            line,
            file,
            enabled: true,
            conditional: false,
            condition: None,
        }
    }

    /// The condition to check on a hit, if conditional evaluation applies.
    pub fn active_condition(&self) -> Option<&BreakpointCondition> {
        if self.conditional {
            self.condition.as_ref()
        } else {
            None
        }
    }
}

/// Breakpoints known to this client, keyed by agent-assigned id.
///
/// Only mutated after the agent has confirmed the corresponding request.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, breakpoint: Breakpoint) {
        self.breakpoints.insert(breakpoint.id, breakpoint);
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub fn remove(&mut self, id: BreakpointId) -> Option<Breakpoint> {
        self.breakpoints.remove(&id)
    }

    pub fn all(&self) -> Vec<Breakpoint> {
        self.breakpoints.values().cloned().collect()
    }

    pub fn set_enabled(&mut self, id: BreakpointId, enabled: bool) -> Result<()> {
        self.get_mut(id)?.enabled = enabled;
        Ok(())
    }

    pub fn set_condition(&mut self, id: BreakpointId, condition: BreakpointCondition) -> Result<()> {
        self.get_mut(id)?.condition = Some(condition);
        Ok(())
    }

    pub fn set_conditional(&mut self, id: BreakpointId, conditional: bool) -> Result<()> {
        self.get_mut(id)?.conditional = conditional;
        Ok(())
    }

    pub fn active_condition(&self, id: BreakpointId) -> Option<BreakpointCondition> {
        self.get(id)?.active_condition().cloned()
    }

    fn get_mut(&mut self, id: BreakpointId) -> Result<&mut Breakpoint> {
        self.breakpoints
            .get_mut(&id)
            .ok_or(AgentError::UnknownBreakpoint(id))
    }
}

/// Requests a conditional hit needs to issue ahead of queued application
/// requests.
pub trait ConditionTarget {
    fn evaluate(
        &self,
        thread_id: ThreadId,
        level: FrameLevel,
        expression: &str,
    ) -> impl Future<Output = Result<String>> + Send;

    fn resume_thread(&self, thread_id: ThreadId) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitDecision {
    /// Surface the event to subscribers.
    Stop,
    /// The condition did not match and the thread was resumed.
    Resumed,
}

/// Decide whether a conditional breakpoint hit is a real stop.
///
/// Evaluation or resume failures count as a stop: a spurious stop is
/// recoverable, a silently skipped breakpoint is not.
pub async fn decide_hit<T: ConditionTarget + Sync>(
    target: &T,
    event: BreakpointEvent,
    condition: &BreakpointCondition,
) -> HitDecision {
    let value = match target
        .evaluate(event.thread_id, CONDITION_FRAME, &condition.expression)
        .await
    {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(
                target: "tether.wire",
                breakpoint = event.breakpoint_id,
                thread = event.thread_id,
                expression = %condition.expression,
                error = %err,
                "breakpoint condition failed to evaluate; stopping"
            );
            return HitDecision::Stop;
        }
    };

    if value == condition.expected {
        tracing::debug!(target: "tether.wire", breakpoint = event.breakpoint_id, %value, "breakpoint condition matched");
        return HitDecision::Stop;
    }

    match target.resume_thread(event.thread_id).await {
        Ok(()) => {
            tracing::debug!(
                target: "tether.wire",
                breakpoint = event.breakpoint_id,
                %value,
                expected = %condition.expected,
                "breakpoint condition not met; resumed"
            );
            HitDecision::Resumed
        }
        Err(err) => {
            tracing::warn!(
                target: "tether.wire",
                breakpoint = event.breakpoint_id,
                thread = event.thread_id,
                error = %err,
                "failed to resume after unmet condition; stopping"
            );
            HitDecision::Stop
        }
    }
}

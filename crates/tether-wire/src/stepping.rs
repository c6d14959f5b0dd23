//! Single-step rendezvous and the client-driven long step.

use std::future::Future;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::sync::MutexExt;
use crate::protocol::STEP_UNTIL_TRACKED;
use crate::types::{AgentError, Frame, FrameLanguage, Result, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    Line,
    Out,
    Over,
}

impl StepKind {
    pub fn tag(self) -> u32 {
        match self {
            Self::Line => 0,
            Self::Out => 1,
            Self::Over => 2,
        }
    }

    /// Payload word of a step request.
    pub fn request_word(self) -> u32 {
        self.tag() | STEP_UNTIL_TRACKED
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Out => "out",
            Self::Over => "over",
        }
    }
}

/// A step as requested by callers: `over`, `long-over`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCommand {
    Single(StepKind),
    Long(StepKind),
}

impl FromStr for StepCommand {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (long, kind) = match s.strip_prefix("long-") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let kind = match kind {
            "line" | "into" => StepKind::Line,
            "out" => StepKind::Out,
            "over" => StepKind::Over,
            other => return Err(format!("unknown step kind `{other}`")),
        };
        Ok(if long {
            Self::Long(kind)
        } else {
            Self::Single(kind)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    Reply,
    Event { thread_id: ThreadId },
}

type Done = oneshot::Sender<Result<()>>;

#[derive(Debug, Default)]
enum StepSlot {
    #[default]
    Idle,
    /// Step request sent; neither its reply nor the completion event seen.
    Waiting { thread_id: ThreadId, done: Done },
    /// One of the two arrivals has been seen; the next one completes the step.
    HalfArrived { thread_id: ThreadId, done: Done },
}

/// One-slot rendezvous between a step's direct reply and the asynchronous
/// step-completed event. Whichever arrives second resolves the step.
#[derive(Debug, Default)]
pub struct StepRendezvous {
    slot: Mutex<StepSlot>,
}

impl StepRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        !matches!(*self.slot.lock_or_recover("StepRendezvous::is_pending"), StepSlot::Idle)
    }

    /// Claim the slot for a new step.
    pub fn begin(&self, thread_id: ThreadId) -> Result<oneshot::Receiver<Result<()>>> {
        let mut slot = self.slot.lock_or_recover("StepRendezvous::begin");
        if !matches!(*slot, StepSlot::Idle) {
            return Err(AgentError::StepInProgress);
        }
        let (done, rx) = oneshot::channel();
        *slot = StepSlot::Waiting { thread_id, done };
        Ok(rx)
    }

    pub fn arrive(&self, arrival: Arrival) {
        let mut slot = self.slot.lock_or_recover("StepRendezvous::arrive");
        match std::mem::take(&mut *slot) {
            StepSlot::Idle => {
                tracing::debug!(target: "tether.wire", ?arrival, "step arrival with no step pending");
            }
            StepSlot::Waiting { thread_id, done } => {
                if !arrival_matches(arrival, thread_id) {
                    tracing::debug!(target: "tether.wire", ?arrival, thread_id, "ignoring step event for another thread");
                    *slot = StepSlot::Waiting { thread_id, done };
                    return;
                }
                *slot = StepSlot::HalfArrived { thread_id, done };
            }
            StepSlot::HalfArrived { thread_id, done } => {
                if !arrival_matches(arrival, thread_id) {
                    tracing::debug!(target: "tether.wire", ?arrival, thread_id, "ignoring step event for another thread");
                    *slot = StepSlot::HalfArrived { thread_id, done };
                    return;
                }
                let _ = done.send(Ok(()));
            }
        }
    }

    /// Fail the pending step (if any) and free the slot.
    pub fn abort(&self, err: AgentError) {
        let mut slot = self.slot.lock_or_recover("StepRendezvous::abort");
        match std::mem::take(&mut *slot) {
            StepSlot::Idle => {}
            StepSlot::Waiting { done, .. } | StepSlot::HalfArrived { done, .. } => {
                let _ = done.send(Err(err));
            }
        }
    }
}

fn arrival_matches(arrival: Arrival, pending: ThreadId) -> bool {
    match arrival {
        Arrival::Reply => true,
        Arrival::Event { thread_id } => thread_id == pending,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum LongStepOutcome {
    /// Stopped in a new frame of the tracked language.
    Arrived { frame: Frame },
    Cancelled,
}

/// Operations the long-step loop needs from a connection.
pub trait StepTarget {
    fn single_step(
        &self,
        thread_id: ThreadId,
        kind: StepKind,
    ) -> impl Future<Output = Result<()>> + Send;

    fn stack(&self, thread_id: ThreadId) -> impl Future<Output = Result<Vec<Frame>>> + Send;
}

/// Step repeatedly until the top frame is a tracked-language stop point that
/// differs from where the step started, or `cancel` fires.
///
/// `cancel` is checked before every single step so a concurrent pause takes
/// effect on the next iteration.
pub async fn run_long_step<T: StepTarget + Sync>(
    target: &T,
    thread_id: ThreadId,
    kind: StepKind,
    cancel: &CancellationToken,
) -> Result<LongStepOutcome> {
    let origin = target
        .stack(thread_id)
        .await?
        .iter()
        .find(|frame| frame.language == FrameLanguage::Tracked)
        .map(Frame::identity);

    let mut steps = 0u32;
    loop {
        if cancel.is_cancelled() {
            tracing::debug!(target: "tether.wire", thread_id, steps, "long step cancelled");
            return Ok(LongStepOutcome::Cancelled);
        }

        target.single_step(thread_id, kind).await?;
        steps += 1;

        let frames = target.stack(thread_id).await?;
        if let Some(top) = frames.into_iter().next() {
            if top.is_stop_point() && origin.as_ref() != Some(&top.identity()) {
                tracing::debug!(target: "tether.wire", thread_id, steps, frame = %top.name, "long step arrived");
                return Ok(LongStepOutcome::Arrived { frame: top });
            }
        }
    }
}

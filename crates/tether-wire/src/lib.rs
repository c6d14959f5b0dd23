//! Client for the Tether debug-agent wire protocol.
//!
//! The agent speaks a length-prefixed binary protocol over a byte stream,
//! answers exactly one request at a time, and interleaves asynchronous
//! events (breakpoint hits, thread start/end, step completion) with replies.
//!
//! [`Engine`] is the socket-free state machine. [`AgentClient`] runs it over
//! tokio and adds conditional breakpoints, the step rendezvous and the
//! client-driven long step on top.

pub mod breakpoints;
mod client;
pub mod codec;
pub mod engine;
pub mod protocol;
pub mod stepping;
pub mod subscribers;
pub mod sync;
pub mod types;

pub use breakpoints::{BreakpointTable, HitDecision};
pub use client::{AgentClient, AgentClientConfig, QueueLock};
pub use codec::ByteOrder;
pub use engine::{ConnectionState, Engine, Lane};
pub use stepping::{LongStepOutcome, StepCommand, StepKind};
pub use subscribers::{Subscribers, SubscriptionId};
pub use types::{
    AgentError, AgentInfo, Breakpoint, BreakpointCondition, BreakpointEvent, BreakpointId,
    BreakpointKind, Frame, FrameLanguage, FrameLevel, LocalValue, LocalVariable, Result,
    ThreadEvent, ThreadEventKind, ThreadFlags, ThreadId, ThreadInfo, ThreadState,
};

// Compiled for this crate's own tests, and behind `wire-test-support` for
// downstream integration suites.
#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;

use std::future::{ready, Future};

use serde::Serialize;
use serde_json::{Map, Value};
use tether_wire::{AgentClient, StepCommand};

use crate::command::{Call, Envelope};
use crate::error::Result;
use crate::BoxFuture;

/// Run `call` against a direct agent connection.
///
/// Wire requests are enqueued before this returns, so calls reach the agent
/// in the order `execute` was called.
pub(crate) fn execute(client: &AgentClient, call: Call) -> BoxFuture<Result<Envelope>> {
    match call {
        Call::ListThreadIds => keyed("threadIds", client.list_thread_ids()),
        Call::GetThreadInfo { thread_id } => keyed("thread", client.thread_info(thread_id)),
        Call::SuspendThread { thread_id } => empty(client.suspend_thread(thread_id)),
        Call::ResumeThread { thread_id } => empty(client.resume_thread(thread_id)),
        Call::GetThreadStack { thread_id } => keyed("frames", client.thread_stack(thread_id)),
        Call::GetFrameLocals { thread_id, level } => {
            keyed("locals", client.frame_locals(thread_id, level))
        }
        Call::GetSourceFile { method } => keyed("path", client.source_file(&method)),
        Call::SetBreakpoint { method, line, file } => keyed(
            "breakpoint",
            client.set_breakpoint(&method, line, file.as_deref()),
        ),
        Call::EnableBreakpoint { id } => empty(client.enable_breakpoint(id)),
        Call::DisableBreakpoint { id } => empty(client.disable_breakpoint(id)),
        Call::DeleteBreakpoint { id } => empty(client.delete_breakpoint(id)),
        Call::SetBreakpointCondition {
            id,
            expression,
            expected,
        } => empty(ready(
            client.set_breakpoint_condition(id, &expression, &expected),
        )),
        Call::SetBreakpointConditionalEnabled { id, enabled } => {
            empty(ready(client.set_breakpoint_conditional(id, enabled)))
        }
        Call::GetBreakpoints => keyed("breakpoints", ready(Ok(client.breakpoints()))),
        Call::Evaluate {
            thread_id,
            level,
            expression,
        } => keyed("value", client.evaluate(thread_id, level, &expression)),
        Call::Step {
            thread_id,
            step: StepCommand::Single(kind),
            count,
        } => empty(client.step(thread_id, kind, count)),
        Call::Step {
            thread_id,
            step: StepCommand::Long(kind),
            ..
        } => {
            let client = client.clone();
            Box::pin(async move {
                let outcome = client.long_step(thread_id, kind).await?;
                match serde_json::to_value(outcome)? {
                    Value::Object(fields) => Ok(fields),
                    _ => Ok(Map::new()),
                }
            })
        }
    }
}

fn keyed<T, F>(key: &'static str, fut: F) -> BoxFuture<Result<Envelope>>
where
    T: Serialize,
    F: Future<Output = tether_wire::Result<T>> + Send + 'static,
{
    Box::pin(async move {
        let value = serde_json::to_value(fut.await?)?;
        let mut fields = Map::new();
        fields.insert(key.to_string(), value);
        Ok(fields)
    })
}

fn empty<F>(fut: F) -> BoxFuture<Result<Envelope>>
where
    F: Future<Output = tether_wire::Result<()>> + Send + 'static,
{
    Box::pin(async move {
        fut.await?;
        Ok(Map::new())
    })
}

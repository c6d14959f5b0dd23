//! Sans-IO protocol state machine.
//!
//! The engine owns the request queues, the reassembly buffer and the
//! currently dispatched request. It never touches a socket: inbound bytes are
//! pushed in with [`Engine::feed`] and outbound frames are drained with
//! [`Engine::take_outbox`]. The tokio connection in `client.rs` wraps it in a
//! single mutex so queue, state and continuations always change together.

use std::collections::VecDeque;
use std::mem;

use tokio::sync::oneshot;

use crate::codec::ByteOrder;
use crate::protocol::{
    classify, error_message, AgentEvent, Inbound, Message, ReplyShape, Request, AGENT_HANDSHAKE,
    AGENT_HANDSHAKE_LEN, HEADER_LEN,
};
use crate::types::{AgentError, AgentInfo, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHandshake,
    Idle,
    AwaitingSingleReply,
    AwaitingMultiReply,
}

impl From<ReplyShape> for ConnectionState {
    fn from(shape: ReplyShape) -> Self {
        match shape {
            ReplyShape::Single => Self::AwaitingSingleReply,
            ReplyShape::Multi => Self::AwaitingMultiReply,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPayload {
    Single(Message),
    /// Replies in the order the agent sent them, end marker excluded.
    Multi(Vec<Message>),
}

pub type ReplySender = oneshot::Sender<Result<ReplyPayload>>;
pub type ReplyReceiver = oneshot::Receiver<Result<ReplyPayload>>;

/// Which queue a new request joins while the engine is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lane {
    /// Application requests are deferred while locked.
    #[default]
    Application,
    /// Internal requests skip ahead of deferred application requests.
    Bypass,
}

#[derive(Debug)]
pub struct PendingRequest {
    request: Request,
    reply: ReplySender,
}

impl PendingRequest {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn next_state(&self) -> ConnectionState {
        self.request.opcode.reply_shape().into()
    }
}

#[derive(Debug)]
struct InFlight {
    request: Request,
    reply: ReplySender,
    accumulated: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutput {
    Handshake(AgentInfo),
    Event(AgentEvent),
    /// An event for which [`Engine::feed_with`] took a queue lock. The caller
    /// owns that lock and must release it with [`Engine::unlock`].
    LockedEvent(AgentEvent),
}

#[derive(Debug)]
pub struct Engine {
    state: ConnectionState,
    info: Option<AgentInfo>,
    inbound: Vec<u8>,
    max_message_len: usize,
    queue: VecDeque<PendingRequest>,
    deferred: VecDeque<PendingRequest>,
    lock_depth: usize,
    in_flight: Option<InFlight>,
    outbox: Vec<Vec<u8>>,
    closed: Option<AgentError>,
}

impl Engine {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            state: ConnectionState::AwaitingHandshake,
            info: None,
            inbound: Vec::new(),
            max_message_len,
            queue: VecDeque::new(),
            deferred: VecDeque::new(),
            lock_depth: 0,
            in_flight: None,
            outbox: Vec::new(),
            closed: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn info(&self) -> Option<AgentInfo> {
        self.info
    }

    pub fn is_locked(&self) -> bool {
        self.lock_depth > 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn queued(&self) -> impl Iterator<Item = &PendingRequest> {
        self.queue.iter()
    }

    pub fn deferred(&self) -> impl Iterator<Item = &PendingRequest> {
        self.deferred.iter()
    }

    pub fn in_flight(&self) -> Option<&Request> {
        self.in_flight.as_ref().map(|f| &f.request)
    }

    /// Queue a request and dispatch it if the engine is idle.
    pub fn submit(&mut self, request: Request, lane: Lane) -> ReplyReceiver {
        let (tx, rx) = oneshot::channel();
        if let Some(err) = &self.closed {
            let _ = tx.send(Err(err.clone()));
            return rx;
        }

        let pending = PendingRequest { request, reply: tx };
        if self.is_locked() && lane == Lane::Application {
            self.deferred.push_back(pending);
        } else {
            self.queue.push_back(pending);
        }
        self.dispatch();
        rx
    }

    /// Defer all queued and future application requests until the matching
    /// [`Engine::unlock`].
    pub fn lock(&mut self) {
        self.lock_depth += 1;
        if self.lock_depth == 1 {
            self.deferred.extend(self.queue.drain(..));
        }
    }

    pub fn unlock(&mut self) {
        if self.lock_depth == 0 {
            tracing::warn!(target: "tether.wire", "unlock called on an unlocked engine");
            return;
        }
        self.lock_depth -= 1;
        if self.lock_depth == 0 {
            let mut merged = mem::take(&mut self.deferred);
            merged.append(&mut self.queue);
            self.queue = merged;
            self.dispatch();
        }
    }

    /// Frames ready to be written, in dispatch order.
    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        mem::take(&mut self.outbox)
    }

    /// Push received bytes through the state machine.
    ///
    /// Partial frames stay buffered until a later call completes them. A
    /// returned error is fatal: every pending request has already been
    /// rejected with it.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<EngineOutput>> {
        self.feed_with(bytes, |_| false)
    }

    /// Like [`Engine::feed`], but locks the queue as soon as an event
    /// satisfying `lock_on` is parsed, before any later message in the same
    /// read can dispatch another request.
    pub fn feed_with(
        &mut self,
        bytes: &[u8],
        mut lock_on: impl FnMut(&AgentEvent) -> bool,
    ) -> Result<Vec<EngineOutput>> {
        if let Some(err) = &self.closed {
            return Err(err.clone());
        }
        self.inbound.extend_from_slice(bytes);

        let mut out = Vec::new();
        match self.drain_inbound(&mut out, &mut lock_on) {
            Ok(()) => Ok(out),
            Err(err) => {
                self.fail_all(err.clone());
                Err(err)
            }
        }
    }

    /// Reject every queued, deferred and in-flight request. Later
    /// submissions fail immediately.
    pub fn fail_all(&mut self, err: AgentError) {
        if let Some(flight) = self.in_flight.take() {
            let _ = flight.reply.send(Err(err.clone()));
        }
        for pending in self.queue.drain(..).chain(self.deferred.drain(..)) {
            let _ = pending.reply.send(Err(err.clone()));
        }
        self.inbound.clear();
        self.outbox.clear();
        if self.closed.is_none() {
            self.closed = Some(err);
        }
    }

    fn drain_inbound(
        &mut self,
        out: &mut Vec<EngineOutput>,
        lock_on: &mut dyn FnMut(&AgentEvent) -> bool,
    ) -> Result<()> {
        loop {
            let Some(order) = self.info.map(|info| info.byte_order) else {
                if !self.read_handshake(out)? {
                    return Ok(());
                }
                continue;
            };

            if self.inbound.len() < 4 {
                return Ok(());
            }
            let len = order.u32_from([
                self.inbound[0],
                self.inbound[1],
                self.inbound[2],
                self.inbound[3],
            ]) as usize;
            if len < HEADER_LEN || len > self.max_message_len {
                return Err(AgentError::Protocol(format!(
                    "invalid message length {len} (min {HEADER_LEN}, max {})",
                    self.max_message_len
                )));
            }
            if self.inbound.len() < len {
                return Ok(());
            }

            let frame: Vec<u8> = self.inbound.drain(..len).collect();
            let message = Message::parse(&frame, order)?;
            self.process(message, out, lock_on)?;
        }
    }

    /// Returns `true` once the handshake has been consumed.
    fn read_handshake(&mut self, out: &mut Vec<EngineOutput>) -> Result<bool> {
        let seen = self.inbound.len().min(AGENT_HANDSHAKE.len());
        if self.inbound[..seen] != AGENT_HANDSHAKE[..seen] {
            return Err(AgentError::HandshakeMismatch {
                received: String::from_utf8_lossy(&self.inbound[..seen]).into_owned(),
            });
        }
        if self.inbound.len() < AGENT_HANDSHAKE_LEN {
            return Ok(false);
        }

        let flag = self.inbound[AGENT_HANDSHAKE.len()];
        let byte_order = ByteOrder::from_flag(flag)
            .ok_or_else(|| AgentError::Protocol(format!("invalid endianness flag {flag}")))?;
        let v = &self.inbound[AGENT_HANDSHAKE.len() + 1..AGENT_HANDSHAKE_LEN];
        let version = byte_order.u32_from([v[0], v[1], v[2], v[3]]);
        self.inbound.drain(..AGENT_HANDSHAKE_LEN);

        let info = AgentInfo {
            byte_order,
            version,
        };
        tracing::debug!(target: "tether.wire", ?byte_order, version, "agent handshake complete");
        self.info = Some(info);
        self.state = ConnectionState::Idle;
        out.push(EngineOutput::Handshake(info));
        self.dispatch();
        Ok(true)
    }

    fn process(
        &mut self,
        message: Message,
        out: &mut Vec<EngineOutput>,
        lock_on: &mut dyn FnMut(&AgentEvent) -> bool,
    ) -> Result<()> {
        match classify(message)? {
            Inbound::Event(event) if lock_on(&event) => {
                self.lock();
                out.push(EngineOutput::LockedEvent(event));
            }
            Inbound::Event(event) => out.push(EngineOutput::Event(event)),
            Inbound::Error { code } => {
                let message = error_message(code);
                match self.in_flight.take() {
                    Some(flight) => {
                        tracing::debug!(
                            target: "tether.wire",
                            opcode = ?flight.request.opcode,
                            code,
                            %message,
                            "agent rejected request"
                        );
                        let _ = flight.reply.send(Err(AgentError::Agent { code, message }));
                    }
                    None => {
                        tracing::warn!(target: "tether.wire", code, %message, "agent error with no request in flight");
                    }
                }
                self.finish();
            }
            Inbound::Reply(reply) => match self.state {
                ConnectionState::AwaitingSingleReply => {
                    if let Some(flight) = self.in_flight.take() {
                        let _ = flight.reply.send(Ok(ReplyPayload::Single(reply)));
                    }
                    self.finish();
                }
                ConnectionState::AwaitingMultiReply => {
                    if reply.is_end_of_replies() {
                        if let Some(flight) = self.in_flight.take() {
                            let _ = flight.reply.send(Ok(ReplyPayload::Multi(flight.accumulated)));
                        }
                        self.finish();
                    } else if let Some(flight) = self.in_flight.as_mut() {
                        flight.accumulated.push(reply);
                    }
                }
                ConnectionState::Idle | ConnectionState::AwaitingHandshake => {
                    tracing::warn!(target: "tether.wire", b = reply.b, c = reply.c, "dropping unsolicited reply");
                }
            },
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.state = ConnectionState::Idle;
        self.dispatch();
    }

    /// Send the head of the queue if nothing is in flight.
    fn dispatch(&mut self) {
        if self.state != ConnectionState::Idle || self.in_flight.is_some() {
            return;
        }
        let Some(order) = self.info.map(|info| info.byte_order) else {
            return;
        };
        let Some(pending) = self.queue.pop_front() else {
            return;
        };

        let next_state = pending.next_state();
        tracing::debug!(
            target: "tether.wire",
            opcode = ?pending.request.opcode,
            b = pending.request.b,
            c = pending.request.c,
            "dispatching request"
        );
        self.outbox.push(pending.request.encode(order));
        self.state = next_state;
        self.in_flight = Some(InFlight {
            request: pending.request,
            reply: pending.reply,
            accumulated: Vec::new(),
        });
    }
}

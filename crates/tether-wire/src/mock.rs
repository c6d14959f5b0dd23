use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpListener},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{ByteOrder, WireReader, WireWriter},
    protocol::{
        Message, Opcode, AGENT_HANDSHAKE, CLIENT_HANDSHAKE, END_OF_REPLIES, EVENT_BREAKPOINT_HIT,
        EVENT_STEP_COMPLETED, EVENT_THREAD_ENDED, EVENT_THREAD_STARTED, HEADER_LEN,
        LOCAL_FLAG_ARGUMENT, REPLY_KIND_ERROR, REPLY_KIND_EVENT, REPLY_KIND_REPLY, VALUE_TAG_BOOL,
        VALUE_TAG_DOUBLE, VALUE_TAG_FLOAT, VALUE_TAG_INT, VALUE_TAG_STRING,
    },
    sync::MutexExt,
    types::{BreakpointId, Frame, LocalValue, ThreadFlags, ThreadId, ThreadState},
};

/// Agent error codes the mock produces on its own.
pub const ERROR_INVALID_THREAD: u32 = 1;
pub const ERROR_INVALID_FRAME: u32 = 3;
pub const ERROR_INVALID_BREAKPOINT: u32 = 5;
pub const ERROR_EVALUATION_FAILED: u32 = 6;
pub const ERROR_SOURCE_UNAVAILABLE: u32 = 8;

/// A scripted debug agent for unit and integration tests.
///
/// Accepts a single connection on localhost, answers requests from its
/// [`MockAgentConfig`] and records every request it receives.
pub struct MockAgent {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockThread {
    pub id: ThreadId,
    pub name: String,
    pub priority: u32,
    pub daemon: bool,
    pub state: ThreadState,
    pub flags: ThreadFlags,
}

impl MockThread {
    pub fn new(id: ThreadId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            priority: 5,
            daemon: false,
            state: ThreadState::Runnable,
            flags: ThreadFlags::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockLocal {
    pub name: String,
    pub argument: bool,
    pub value: LocalValue,
}

/// Scripted outcome of an `Evaluate` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockEval {
    Value(String),
    Error(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockEvent {
    BreakpointHit {
        breakpoint_id: BreakpointId,
        thread_id: ThreadId,
    },
    ThreadStarted(ThreadId),
    ThreadEnded(ThreadId),
    StepCompleted(ThreadId),
    /// An event kind the client does not know.
    Other { kind: u32, thread_id: ThreadId },
}

#[derive(Clone, Debug)]
pub struct MockAgentConfig {
    pub byte_order: ByteOrder,
    pub version: u32,
    /// Overrides the agent identifier sent during the handshake.
    pub handshake_identifier: Option<Vec<u8>>,
    pub threads: Vec<MockThread>,
    /// Stacks returned by successive `ThreadStack` requests for a thread. The
    /// last stack is repeated once the script runs out.
    pub stacks: HashMap<ThreadId, Vec<Vec<Frame>>>,
    pub locals: Vec<MockLocal>,
    /// Results of successive evaluations of an expression. The last result
    /// is repeated; unknown expressions fail with evaluation-failed.
    pub evaluations: HashMap<String, Vec<MockEval>>,
    pub source_files: HashMap<String, String>,
    /// Error code returned for every request with this opcode.
    pub errors: HashMap<Opcode, u32>,
    /// Emit step-completed before the step reply instead of after it.
    pub step_event_first: bool,
    /// Event emitted right ahead of the reply to the first request with the
    /// given opcode, in the same write.
    pub event_before_reply: Vec<(Opcode, MockEvent)>,
    /// Breakpoint hit emitted after each of the first N `ResumeThread` replies.
    pub hit_after_resume: Option<(MockEvent, usize)>,
    pub reply_delays: HashMap<Opcode, Duration>,
    /// Write outgoing bytes in pieces of at most this size.
    pub write_chunk: Option<usize>,
}

impl Default for MockAgentConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::BigEndian,
            version: 1,
            handshake_identifier: None,
            threads: vec![MockThread::new(MAIN_THREAD_ID, "main")],
            stacks: HashMap::new(),
            locals: Vec::new(),
            evaluations: HashMap::new(),
            source_files: HashMap::new(),
            errors: HashMap::new(),
            step_event_first: false,
            event_before_reply: Vec::new(),
            hit_after_resume: None,
            reply_delays: HashMap::new(),
            write_chunk: None,
        }
    }
}

pub const MAIN_THREAD_ID: ThreadId = 1;

/// A request as the mock received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub opcode: Opcode,
    pub b: u32,
    pub c: u32,
    pub payload: Vec<u8>,
}

impl RecordedRequest {
    /// Leading string field of the payload, if any.
    pub fn string_arg(&self, order: ByteOrder) -> Option<String> {
        WireReader::new(&self.payload, order).read_string().ok()
    }
}

struct State {
    config: MockAgentConfig,
    requests: Mutex<Vec<RecordedRequest>>,
    stack_cursor: Mutex<HashMap<ThreadId, usize>>,
    eval_cursor: Mutex<HashMap<String, usize>>,
    fired_before_reply: Mutex<Vec<bool>>,
    hits_after_resume: AtomicUsize,
    next_breakpoint_id: AtomicU32,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MockAgent {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockAgentConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockAgentConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State {
            hits_after_resume: AtomicUsize::new(
                config.hit_after_resume.as_ref().map_or(0, |(_, n)| *n),
            ),
            fired_before_reply: Mutex::new(vec![false; config.event_before_reply.len()]),
            config,
            requests: Mutex::new(Vec::new()),
            stack_cursor: Mutex::new(HashMap::new()),
            eval_cursor: Mutex::new(HashMap::new()),
            next_breakpoint_id: AtomicU32::new(1),
            outbound: Mutex::new(None),
        });

        let task_state = state.clone();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = run(listener, task_state, task_shutdown).await {
                tracing::debug!(target: "tether.wire", error = %err, "mock agent stopped");
            }
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.state.config.byte_order
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock_or_recover("MockAgent::requests").clone()
    }

    pub fn opcodes(&self) -> Vec<Opcode> {
        self.requests().into_iter().map(|r| r.opcode).collect()
    }

    /// Send an event to the connected client. Returns `false` if no client is
    /// connected.
    pub fn emit(&self, event: MockEvent) -> bool {
        let frame = event_frame(self.state.config.byte_order, &event);
        self.send_raw(frame)
    }

    /// Send several events in a single write.
    pub fn emit_all(&self, events: &[MockEvent]) -> bool {
        let order = self.state.config.byte_order;
        let bytes = events
            .iter()
            .flat_map(|event| event_frame(order, event))
            .collect();
        self.send_raw(bytes)
    }

    /// Send arbitrary bytes to the connected client.
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.state.outbound.lock_or_recover("MockAgent::send_raw")
            .as_ref()
            .is_some_and(|tx| tx.send(bytes).is_ok())
    }

    /// Drop the client connection.
    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (socket, _) = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accept = listener.accept() => accept?,
    };
    let _ = socket.set_nodelay(true);
    let (mut reader, writer) = socket.into_split();

    let mut hs = [0u8; CLIENT_HANDSHAKE.len()];
    reader.read_exact(&mut hs).await?;
    if hs != *CLIENT_HANDSHAKE {
        return Ok(());
    }

    let (tx, rx) = mpsc::unbounded_channel();
    *state.outbound.lock_or_recover("mock::run") = Some(tx.clone());
    let writer_task = tokio::spawn(write_frames(
        writer,
        rx,
        state.config.write_chunk,
        shutdown.clone(),
    ));

    let order = state.config.byte_order;
    let mut hello = state
        .config
        .handshake_identifier
        .clone()
        .unwrap_or_else(|| AGENT_HANDSHAKE.to_vec());
    hello.push(order.flag());
    hello.extend_from_slice(&order.u32_bytes(state.config.version));
    let _ = tx.send(hello);

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = read_request(&mut reader, order) => res?,
        };
        let Some(request) = request else {
            break;
        };
        state.requests.lock_or_recover("mock::run").push(request.clone());
        if let Some(delay) = state.config.reply_delays.get(&request.opcode) {
            tokio::time::sleep(*delay).await;
        }
        let bytes = handle_request(&state, &request);
        if tx.send(bytes).is_err() {
            break;
        }
    }

    *state.outbound.lock_or_recover("mock::run") = None;
    drop(tx);
    writer_task.abort();
    Ok(())
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    chunk: Option<usize>,
    shutdown: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = shutdown.cancelled() => break,
            bytes = rx.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let pieces: Vec<&[u8]> = match chunk {
            Some(size) => bytes.chunks(size.max(1)).collect(),
            None => vec![&bytes[..]],
        };
        for piece in pieces {
            if writer.write_all(piece).await.is_err() {
                return;
            }
            if chunk.is_some() {
                let _ = writer.flush().await;
                tokio::task::yield_now().await;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_request(
    reader: &mut OwnedReadHalf,
    order: ByteOrder,
) -> std::io::Result<Option<RecordedRequest>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let word = |i: usize| order.u32_from([header[i], header[i + 1], header[i + 2], header[i + 3]]);
    let length = word(0) as usize;
    if length < HEADER_LEN {
        return Ok(None);
    }
    let Some(opcode) = Opcode::from_code(word(4)) else {
        return Ok(None);
    };
    let mut payload = vec![0u8; length - HEADER_LEN];
    reader.read_exact(&mut payload).await?;
    Ok(Some(RecordedRequest {
        opcode,
        b: word(8),
        c: word(12),
        payload,
    }))
}

fn message(order: ByteOrder, a: u32, b: u32, c: u32, payload: Vec<u8>) -> Vec<u8> {
    Message {
        order,
        a,
        b,
        c,
        payload,
    }
    .encode()
}

fn reply(order: ByteOrder, b: u32, c: u32, payload: impl FnOnce(&mut WireWriter)) -> Vec<u8> {
    let mut w = WireWriter::new(order);
    payload(&mut w);
    message(order, REPLY_KIND_REPLY, b, c, w.into_vec())
}

fn error(order: ByteOrder, code: u32) -> Vec<u8> {
    message(order, REPLY_KIND_ERROR, code, 0, Vec::new())
}

fn end_of_replies(order: ByteOrder) -> Vec<u8> {
    message(order, REPLY_KIND_REPLY, 0, END_OF_REPLIES, Vec::new())
}

fn event_frame(order: ByteOrder, event: &MockEvent) -> Vec<u8> {
    let (kind, thread_id, payload) = match *event {
        MockEvent::BreakpointHit {
            breakpoint_id,
            thread_id,
        } => (
            EVENT_BREAKPOINT_HIT,
            thread_id,
            order.u32_bytes(breakpoint_id).to_vec(),
        ),
        MockEvent::ThreadStarted(thread_id) => (EVENT_THREAD_STARTED, thread_id, Vec::new()),
        MockEvent::ThreadEnded(thread_id) => (EVENT_THREAD_ENDED, thread_id, Vec::new()),
        MockEvent::StepCompleted(thread_id) => (EVENT_STEP_COMPLETED, thread_id, Vec::new()),
        MockEvent::Other { kind, thread_id } => (kind, thread_id, Vec::new()),
    };
    message(order, REPLY_KIND_EVENT, kind, thread_id, payload)
}

/// Bytes to write in response to one request: the reply plus any scripted
/// events around it.
fn handle_request(state: &State, request: &RecordedRequest) -> Vec<u8> {
    let order = state.config.byte_order;
    let mut out = Vec::new();

    {
        let mut fired = state.fired_before_reply.lock_or_recover("mock::handle_request");
        for (idx, (opcode, event)) in state.config.event_before_reply.iter().enumerate() {
            if *opcode == request.opcode && !fired[idx] {
                fired[idx] = true;
                out.extend(event_frame(order, event));
            }
        }
    }

    if let Some(code) = state.config.errors.get(&request.opcode) {
        out.extend(error(order, *code));
        return out;
    }

    match request.opcode {
        Opcode::ListThreads => out.extend(reply(order, 0, 0, |w| {
            w.write_u32(state.config.threads.len() as u32);
            for thread in &state.config.threads {
                w.write_u32(thread.id);
            }
        })),
        Opcode::ThreadInfo => match find_thread(state, request.b) {
            Some(thread) => out.extend(reply(order, 0, 0, |w| {
                w.write_u32(thread.priority);
                w.write_u32(thread.daemon as u32);
                w.write_u32(thread.state.code());
                w.write_u32(thread.flags.bits());
                w.write_string(&thread.name);
            })),
            None => out.extend(error(order, ERROR_INVALID_THREAD)),
        },
        Opcode::SuspendThread => out.extend(thread_ack(state, request.b)),
        Opcode::ResumeThread => {
            out.extend(thread_ack(state, request.b));
            if let Some((event, _)) = &state.config.hit_after_resume {
                let remaining = state.hits_after_resume.fetch_update(
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                    |n| n.checked_sub(1),
                );
                if remaining.is_ok() {
                    out.extend(event_frame(order, event));
                }
            }
        }
        Opcode::ThreadStack => match next_stack(state, request.b) {
            Some(frames) => {
                for (level, frame) in frames.iter().enumerate() {
                    out.extend(reply(order, level as u32, 0, |w| {
                        w.write_u32(frame.offset);
                        w.write_u32(frame.language.tag());
                        w.write_string(&frame.name);
                    }));
                }
                out.extend(end_of_replies(order));
            }
            None => out.extend(error(order, ERROR_INVALID_THREAD)),
        },
        Opcode::FrameLocals => {
            if find_thread(state, request.b).is_none() {
                out.extend(error(order, ERROR_INVALID_THREAD));
            } else {
                for local in &state.config.locals {
                    out.extend(reply(order, 0, 0, |w| write_local(w, local)));
                }
                out.extend(end_of_replies(order));
            }
        }
        Opcode::SetBreakpoint => {
            let id = state.next_breakpoint_id.fetch_add(1, Ordering::Relaxed);
            out.extend(reply(order, id, 0, |_| {}));
        }
        Opcode::EnableBreakpoint | Opcode::DisableBreakpoint | Opcode::DeleteBreakpoint => {
            if request.b == 0 || request.b >= state.next_breakpoint_id.load(Ordering::Relaxed) {
                out.extend(error(order, ERROR_INVALID_BREAKPOINT));
            } else {
                out.extend(reply(order, request.b, 0, |_| {}));
            }
        }
        Opcode::Evaluate => {
            let expression = request.string_arg(order).unwrap_or_default();
            match next_eval(state, &expression) {
                MockEval::Value(value) => out.extend(reply(order, 0, 0, |w| w.write_string(&value))),
                MockEval::Error(code) => out.extend(error(order, code)),
            }
        }
        Opcode::SourceFile => {
            let method = request.string_arg(order).unwrap_or_default();
            match state.config.source_files.get(&method) {
                Some(path) => out.extend(reply(order, 0, 0, |w| w.write_string(path))),
                None => out.extend(error(order, ERROR_SOURCE_UNAVAILABLE)),
            }
        }
        Opcode::Step => {
            let thread_id = request.b;
            if find_thread(state, thread_id).is_none() {
                out.extend(error(order, ERROR_INVALID_THREAD));
                return out;
            }
            let done = event_frame(order, &MockEvent::StepCompleted(thread_id));
            let ack = reply(order, thread_id, 0, |_| {});
            if state.config.step_event_first {
                out.extend(done);
                out.extend(ack);
            } else {
                out.extend(ack);
                out.extend(done);
            }
        }
    }
    out
}

fn find_thread(state: &State, id: ThreadId) -> Option<&MockThread> {
    state.config.threads.iter().find(|t| t.id == id)
}

fn thread_ack(state: &State, id: ThreadId) -> Vec<u8> {
    let order = state.config.byte_order;
    match find_thread(state, id) {
        Some(_) => reply(order, id, 0, |_| {}),
        None => error(order, ERROR_INVALID_THREAD),
    }
}

fn next_stack(state: &State, thread_id: ThreadId) -> Option<Vec<Frame>> {
    find_thread(state, thread_id)?;
    let Some(script) = state.config.stacks.get(&thread_id) else {
        return Some(Vec::new());
    };
    let mut cursor = state.stack_cursor.lock_or_recover("mock::next_stack");
    let idx = cursor.entry(thread_id).or_insert(0);
    let stack = script.get(*idx).or_else(|| script.last()).cloned();
    *idx += 1;
    stack
}

fn next_eval(state: &State, expression: &str) -> MockEval {
    let Some(script) = state.config.evaluations.get(expression) else {
        return MockEval::Error(ERROR_EVALUATION_FAILED);
    };
    let mut cursor = state.eval_cursor.lock_or_recover("mock::next_eval");
    let idx = cursor.entry(expression.to_string()).or_insert(0);
    let result = script
        .get(*idx)
        .or_else(|| script.last())
        .cloned()
        .unwrap_or(MockEval::Error(ERROR_EVALUATION_FAILED));
    *idx += 1;
    result
}

fn write_local(w: &mut WireWriter, local: &MockLocal) {
    w.write_string(&local.name);
    w.write_u32(if local.argument { LOCAL_FLAG_ARGUMENT } else { 0 });
    match &local.value {
        LocalValue::Int(v) => {
            w.write_u32(VALUE_TAG_INT);
            w.write_i32(*v);
        }
        LocalValue::Bool(v) => {
            w.write_u32(VALUE_TAG_BOOL);
            w.write_u32(*v as u32);
        }
        LocalValue::Double(v) => {
            w.write_u32(VALUE_TAG_DOUBLE);
            w.write_f64(*v);
        }
        LocalValue::Float(v) => {
            w.write_u32(VALUE_TAG_FLOAT);
            w.write_f32(*v);
        }
        LocalValue::Str(v) => {
            w.write_u32(VALUE_TAG_STRING);
            w.write_string(v);
        }
        LocalValue::Unknown { tag } => {
            w.write_u32(*tag);
            w.write_u32(0);
        }
    }
}

/// Frame helper for scripting stacks.
pub fn frame(name: &str, offset: u32, language: crate::types::FrameLanguage) -> Frame {
    Frame {
        level: 0,
        offset,
        name: name.to_string(),
        language,
    }
}

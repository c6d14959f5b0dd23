use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::{
    breakpoints::{decide_hit, BreakpointTable, ConditionTarget, HitDecision},
    engine::{Engine, EngineOutput, Lane, ReplyPayload, ReplyReceiver},
    protocol::{
        decode_frame, decode_local, decode_string, decode_thread_ids, decode_thread_info,
        AgentEvent, Field, Message, Opcode, Request, CLIENT_HANDSHAKE, DEFAULT_MAX_MESSAGE_LEN,
    },
    stepping::{run_long_step, Arrival, LongStepOutcome, StepKind, StepRendezvous, StepTarget},
    subscribers::Subscribers,
    sync::MutexExt,
    types::{
        AgentError, AgentInfo, Breakpoint, BreakpointCondition, BreakpointEvent, BreakpointId,
        Frame, FrameLevel, LocalVariable, Result, ThreadEvent, ThreadId, ThreadInfo,
    },
};

#[derive(Debug, Clone)]
pub struct AgentClientConfig {
    pub handshake_timeout: Duration,
    /// Size of the socket read buffer. Messages larger than this are
    /// reassembled across reads.
    pub read_buffer_size: usize,
    /// Largest declared message length accepted from the agent.
    pub max_message_len: usize,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            read_buffer_size: 64 * 1024,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// A breakpoint hit waiting for the event dispatcher, with the queue lock
/// already held when its condition has to be evaluated.
struct PendingHit {
    event: BreakpointEvent,
    condition: Option<(BreakpointCondition, QueueLock)>,
}

/// Work for the event dispatcher. Events are published inline by the read
/// loop unless the dispatcher still has a backlog, in which case they queue
/// behind it to keep agent order.
enum Dispatch {
    Hit(PendingHit),
    Thread(ThreadEvent),
}

struct Inner {
    engine: Mutex<Engine>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    breakpoints: Mutex<BreakpointTable>,
    breakpoint_events: Subscribers<BreakpointEvent>,
    thread_events: Subscribers<ThreadEvent>,
    dispatcher: mpsc::UnboundedSender<Dispatch>,
    /// Items sent to the dispatcher and not yet published.
    backlog: AtomicUsize,
    stepping: StepRendezvous,
    long_step: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl Inner {
    /// Hand frames produced by the engine to the writer task. Called with the
    /// engine lock held so frames reach the socket in dispatch order.
    fn flush(&self, engine: &mut Engine) {
        for frame in engine.take_outbox() {
            if self.writer.send(frame).is_err() {
                engine.fail_all(AgentError::ConnectionClosed);
                break;
            }
        }
    }

    fn submit(&self, request: Request, lane: Lane) -> ReplyReceiver {
        let mut engine = self.engine.lock_or_recover("Inner::submit");
        let rx = engine.submit(request, lane);
        self.flush(&mut engine);
        rx
    }

    /// Feed received bytes to the engine. Hits on conditional breakpoints
    /// lock the queue inside the engine, before anything else is dispatched.
    fn feed(&self, bytes: &[u8]) -> Result<Vec<EngineOutput>> {
        let mut engine = self.engine.lock_or_recover("Inner::feed");
        let out = engine.feed_with(bytes, |event| match event {
            AgentEvent::Breakpoint(hit) => self
                .breakpoints
                .lock_or_recover("Inner::feed")
                .active_condition(hit.breakpoint_id)
                .is_some(),
            _ => false,
        })?;
        self.flush(&mut engine);
        Ok(out)
    }

    fn route_event(self: &Arc<Self>, event: AgentEvent, locked: bool) {
        match event {
            AgentEvent::Breakpoint(event) => {
                let queue_lock = locked.then(|| QueueLock::adopt(self));
                let condition = queue_lock.and_then(|queue_lock| {
                    self.breakpoints
                        .lock_or_recover("Inner::route_event")
                        .active_condition(event.breakpoint_id)
                        .map(|condition| (condition, queue_lock))
                });
                if condition.is_none() && self.backlog.load(Ordering::SeqCst) == 0 {
                    self.breakpoint_events.publish(&event);
                } else {
                    self.dispatch(Dispatch::Hit(PendingHit { event, condition }));
                }
            }
            AgentEvent::Thread(event) => {
                if self.backlog.load(Ordering::SeqCst) == 0 {
                    self.thread_events.publish(&event);
                } else {
                    self.dispatch(Dispatch::Thread(event));
                }
            }
            AgentEvent::StepCompleted { thread_id } => {
                self.stepping.arrive(Arrival::Event { thread_id })
            }
            AgentEvent::Unknown { kind, thread_id } => {
                tracing::debug!(target: "tether.wire", kind, thread_id, "ignoring unknown agent event");
            }
        }
    }

    fn dispatch(&self, item: Dispatch) {
        self.backlog.fetch_add(1, Ordering::SeqCst);
        if self.dispatcher.send(item).is_err() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(target: "tether.wire", "event dispatcher gone; dropping event");
        }
    }

    fn cancel_long_step(&self) {
        if let Some(token) = self
            .long_step
            .lock_or_recover("Inner::cancel_long_step")
            .as_ref()
        {
            token.cancel();
        }
    }

    /// Tear the connection down: reject everything pending and signal
    /// shutdown. Idempotent.
    fn terminate(&self, reason: AgentError) {
        if self.shutdown.is_cancelled() {
            return;
        }
        match &reason {
            AgentError::ConnectionClosed => {
                tracing::info!(target: "tether.wire", "agent connection closed")
            }
            other => tracing::warn!(target: "tether.wire", error = %other, "agent connection failed"),
        }
        {
            let mut engine = self.engine.lock_or_recover("Inner::terminate");
            engine.fail_all(reason.clone());
        }
        self.stepping.abort(reason);
        self.cancel_long_step();
        self.shutdown.cancel();
    }
}

/// Scoped queue lock.
///
/// While any `QueueLock` is alive, application requests are deferred. The
/// client returned by [`QueueLock::bypass`] still goes straight to the main
/// queue. Dropping the lock merges deferred requests back in their original
/// order.
pub struct QueueLock {
    inner: Arc<Inner>,
}

impl QueueLock {
    fn acquire(inner: &Arc<Inner>) -> Self {
        inner.engine.lock_or_recover("QueueLock::acquire").lock();
        Self {
            inner: inner.clone(),
        }
    }

    /// Take ownership of a lock the engine already holds.
    fn adopt(inner: &Arc<Inner>) -> Self {
        Self {
            inner: inner.clone(),
        }
    }

    pub fn bypass(&self) -> AgentClient {
        AgentClient {
            inner: self.inner.clone(),
            lane: Lane::Bypass,
        }
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let mut engine = self.inner.engine.lock_or_recover("QueueLock::drop");
        engine.unlock();
        self.inner.flush(&mut engine);
    }
}

/// Clears the running long step's cancellation slot however the step ends.
struct LongStepSlot<'a>(&'a Inner);

impl Drop for LongStepSlot<'_> {
    fn drop(&mut self) {
        *self.0.long_step.lock_or_recover("LongStepSlot::drop") = None;
    }
}

/// Connection to a debug agent.
///
/// Every command enqueues its request when called and returns a future for
/// the decoded reply, so requests reach the agent in call order regardless
/// of when the futures are awaited.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<Inner>,
    lane: Lane,
}

impl AgentClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, AgentClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: AgentClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Self::from_stream(stream, config).await
    }

    /// Run the protocol over an already-connected byte stream.
    pub async fn from_stream<S>(mut stream: S, config: AgentClientConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::time::timeout(config.handshake_timeout, stream.write_all(CLIENT_HANDSHAKE))
            .await
            .map_err(|_| AgentError::Timeout)??;

        let (reader, writer) = tokio::io::split(stream);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let inner = Arc::new(Inner {
            engine: Mutex::new(Engine::new(config.max_message_len)),
            writer: frames_tx,
            breakpoints: Mutex::new(BreakpointTable::new()),
            breakpoint_events: Subscribers::new(),
            thread_events: Subscribers::new(),
            dispatcher: dispatch_tx,
            backlog: AtomicUsize::new(0),
            stepping: StepRendezvous::new(),
            long_step: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, frames_rx, inner.clone()));
        tokio::spawn(read_loop(reader, inner.clone(), config.read_buffer_size, ready_tx));
        tokio::spawn(dispatch_loop(dispatch_rx, inner.clone()));

        let info = match tokio::time::timeout(config.handshake_timeout, ready_rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_closed)) => Err(AgentError::ConnectionClosed),
            Err(_elapsed) => {
                inner.terminate(AgentError::Timeout);
                Err(AgentError::Timeout)
            }
        }?;
        tracing::info!(target: "tether.wire", version = info.version, byte_order = ?info.byte_order, "connected to agent");

        Ok(Self {
            inner,
            lane: Lane::Application,
        })
    }

    pub fn agent_info(&self) -> Option<AgentInfo> {
        self.inner
            .engine
            .lock_or_recover("AgentClient::agent_info")
            .info()
    }

    pub fn shutdown(&self) {
        self.inner.terminate(AgentError::ConnectionClosed);
    }

    /// Cancelled once the connection is gone, whether through
    /// [`AgentClient::shutdown`], a socket error, or a protocol violation.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn breakpoint_events(&self) -> &Subscribers<BreakpointEvent> {
        &self.inner.breakpoint_events
    }

    pub fn thread_events(&self) -> &Subscribers<ThreadEvent> {
        &self.inner.thread_events
    }

    /// Defer application requests until the returned guard is dropped.
    pub fn lock_queue(&self) -> QueueLock {
        QueueLock::acquire(&self.inner)
    }

    fn submit(&self, request: Request) -> ReplyReceiver {
        self.inner.submit(request, self.lane)
    }

    pub fn list_thread_ids(&self) -> impl Future<Output = Result<Vec<ThreadId>>> + Send + 'static {
        let rx = self.submit(Request::new(Opcode::ListThreads, 0, 0));
        async move { decode_thread_ids(&single(rx).await?) }
    }

    pub fn thread_info(
        &self,
        thread_id: ThreadId,
    ) -> impl Future<Output = Result<ThreadInfo>> + Send + 'static {
        let rx = self.submit(Request::new(Opcode::ThreadInfo, thread_id, 0));
        async move { decode_thread_info(&single(rx).await?) }
    }

    /// Suspend a thread. Cancels a running long step first so the pause
    /// takes effect before its next single step.
    pub fn suspend_thread(
        &self,
        thread_id: ThreadId,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner.cancel_long_step();
        let rx = self.submit(Request::new(Opcode::SuspendThread, thread_id, 0));
        async move { single(rx).await.map(drop) }
    }

    pub fn resume_thread(
        &self,
        thread_id: ThreadId,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let rx = self.submit(Request::new(Opcode::ResumeThread, thread_id, 0));
        async move { single(rx).await.map(drop) }
    }

    pub fn thread_stack(
        &self,
        thread_id: ThreadId,
    ) -> impl Future<Output = Result<Vec<Frame>>> + Send + 'static {
        let rx = self.submit(Request::new(Opcode::ThreadStack, thread_id, 0));
        async move { multi(rx).await?.iter().map(decode_frame).collect() }
    }

    pub fn frame_locals(
        &self,
        thread_id: ThreadId,
        level: FrameLevel,
    ) -> impl Future<Output = Result<Vec<LocalVariable>>> + Send + 'static {
        let rx = self.submit(Request::new(Opcode::FrameLocals, thread_id, level));
        async move { multi(rx).await?.iter().map(decode_local).collect() }
    }

    pub fn source_file(&self, method: &str) -> impl Future<Output = Result<String>> + Send + 'static {
        let rx = self.submit(
            Request::new(Opcode::SourceFile, 0, 0).with(Field::Str(method.to_string())),
        );
        async move { decode_string(&single(rx).await?) }
    }

    pub fn evaluate(
        &self,
        thread_id: ThreadId,
        level: FrameLevel,
        expression: &str,
    ) -> impl Future<Output = Result<String>> + Send + 'static {
        let rx = self.submit(
            Request::new(Opcode::Evaluate, thread_id, level)
                .with(Field::Str(expression.to_string())),
        );
        async move { decode_string(&single(rx).await?) }
    }

    /// Set a breakpoint on method entry (`line == None`) or on a line.
    pub fn set_breakpoint(
        &self,
        method: &str,
        line: Option<u32>,
        file: Option<&str>,
    ) -> impl Future<Output = Result<Breakpoint>> + Send + 'static {
        let rx = self.submit(
            Request::new(Opcode::SetBreakpoint, line.unwrap_or(0), 0)
                .with(Field::Str(method.to_string()))
                .with(Field::Str(file.unwrap_or_default().to_string())),
        );
        let inner = self.inner.clone();
        let method = method.to_string();
        let file = file.map(str::to_string);
        confirm(rx, move |reply| {
            let breakpoint = Breakpoint::new(reply.b, method, line, file);
            inner
                .breakpoints
                .lock_or_recover("AgentClient::set_breakpoint")
                .insert(breakpoint.clone());
            Ok(breakpoint)
        })
    }

    pub fn enable_breakpoint(
        &self,
        id: BreakpointId,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.toggle_breakpoint(id, true)
    }

    pub fn disable_breakpoint(
        &self,
        id: BreakpointId,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.toggle_breakpoint(id, false)
    }

    fn toggle_breakpoint(
        &self,
        id: BreakpointId,
        enabled: bool,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let opcode = if enabled {
            Opcode::EnableBreakpoint
        } else {
            Opcode::DisableBreakpoint
        };
        let inner = self.inner.clone();
        let confirmed = self
            .submit_for_known(id, Request::new(opcode, id, 0))
            .map(|rx| {
                confirm(rx, move |_| {
                    inner
                        .breakpoints
                        .lock_or_recover("AgentClient::toggle_breakpoint")
                        .set_enabled(id, enabled)
                })
            });
        async move { confirmed?.await }
    }

    pub fn delete_breakpoint(
        &self,
        id: BreakpointId,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let inner = self.inner.clone();
        let confirmed = self
            .submit_for_known(id, Request::new(Opcode::DeleteBreakpoint, id, 0))
            .map(|rx| {
                confirm(rx, move |_| {
                    inner
                        .breakpoints
                        .lock_or_recover("AgentClient::delete_breakpoint")
                        .remove(id);
                    Ok(())
                })
            });
        async move { confirmed?.await }
    }

    /// Unknown ids are rejected locally without a round trip.
    fn submit_for_known(&self, id: BreakpointId, request: Request) -> Result<ReplyReceiver> {
        let known = self
            .inner
            .breakpoints
            .lock_or_recover("AgentClient::submit_for_known")
            .get(id)
            .is_some();
        if !known {
            return Err(AgentError::UnknownBreakpoint(id));
        }
        Ok(self.submit(request))
    }

    pub fn set_breakpoint_condition(
        &self,
        id: BreakpointId,
        expression: &str,
        expected: &str,
    ) -> Result<()> {
        self.inner
            .breakpoints
            .lock_or_recover("AgentClient::set_breakpoint_condition")
            .set_condition(
                id,
                BreakpointCondition {
                    expression: expression.to_string(),
                    expected: expected.to_string(),
                },
            )
    }

    pub fn set_breakpoint_conditional(&self, id: BreakpointId, conditional: bool) -> Result<()> {
        self.inner
            .breakpoints
            .lock_or_recover("AgentClient::set_breakpoint_conditional")
            .set_conditional(id, conditional)
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.inner
            .breakpoints
            .lock_or_recover("AgentClient::breakpoints")
            .all()
    }

    /// Single step. Resolves once both the step reply and the agent's
    /// step-completed event have arrived, in either order.
    pub fn step(
        &self,
        thread_id: ThreadId,
        kind: StepKind,
        count: u32,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let started = self.inner.stepping.begin(thread_id).map(|done| {
            let rx = self.submit(
                Request::new(Opcode::Step, thread_id, count).with(Field::U32(kind.request_word())),
            );
            // The reply half is recorded even if the caller drops the future,
            // otherwise the slot would stay claimed.
            let inner = self.inner.clone();
            tokio::spawn(async move {
                match single(rx).await {
                    Ok(_) => inner.stepping.arrive(Arrival::Reply),
                    Err(err) => inner.stepping.abort(err),
                }
            });
            done
        });
        async move { started?.await.map_err(|_| AgentError::ConnectionClosed)? }
    }

    /// Keep single-stepping until execution rests in a different frame of
    /// the tracked language. Cancelled by [`AgentClient::cancel_long_step`],
    /// [`AgentClient::suspend_thread`], or connection shutdown.
    pub async fn long_step(&self, thread_id: ThreadId, kind: StepKind) -> Result<LongStepOutcome> {
        let token = self.inner.shutdown.child_token();
        {
            let mut slot = self.inner.long_step.lock_or_recover("AgentClient::long_step");
            if slot.is_some() {
                return Err(AgentError::StepInProgress);
            }
            *slot = Some(token.clone());
        }
        let _slot = LongStepSlot(&self.inner);

        let outcome = run_long_step(self, thread_id, kind, &token).await?;
        if self.is_closed() {
            return Err(AgentError::ConnectionClosed);
        }
        Ok(outcome)
    }

    pub fn cancel_long_step(&self) {
        self.inner.cancel_long_step();
    }
}

impl StepTarget for AgentClient {
    fn single_step(
        &self,
        thread_id: ThreadId,
        kind: StepKind,
    ) -> impl Future<Output = Result<()>> + Send {
        self.step(thread_id, kind, 1)
    }

    fn stack(&self, thread_id: ThreadId) -> impl Future<Output = Result<Vec<Frame>>> + Send {
        self.thread_stack(thread_id)
    }
}

impl ConditionTarget for AgentClient {
    fn evaluate(
        &self,
        thread_id: ThreadId,
        level: FrameLevel,
        expression: &str,
    ) -> impl Future<Output = Result<String>> + Send {
        AgentClient::evaluate(self, thread_id, level, expression)
    }

    fn resume_thread(&self, thread_id: ThreadId) -> impl Future<Output = Result<()>> + Send {
        AgentClient::resume_thread(self, thread_id)
    }
}

/// Apply a single reply to local state in a spawned task, so the update
/// happens even if the caller drops the returned future.
fn confirm<T, F>(rx: ReplyReceiver, apply: F) -> impl Future<Output = Result<T>> + Send + 'static
where
    T: Send + 'static,
    F: FnOnce(Message) -> Result<T> + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = match single(rx).await {
            Ok(reply) => apply(reply),
            Err(err) => Err(err),
        };
        let _ = done_tx.send(result);
    });
    async move { done_rx.await.map_err(|_| AgentError::ConnectionClosed)? }
}

async fn single(rx: ReplyReceiver) -> Result<Message> {
    match rx.await.map_err(|_| AgentError::ConnectionClosed)?? {
        ReplyPayload::Single(message) => Ok(message),
        ReplyPayload::Multi(_) => Err(AgentError::Protocol(
            "expected a single reply, got a reply sequence".to_string(),
        )),
    }
}

async fn multi(rx: ReplyReceiver) -> Result<Vec<Message>> {
    match rx.await.map_err(|_| AgentError::ConnectionClosed)?? {
        ReplyPayload::Multi(messages) => Ok(messages),
        ReplyPayload::Single(_) => Err(AgentError::Protocol(
            "expected a reply sequence, got a single reply".to_string(),
        )),
    }
}

async fn read_loop<R>(
    mut reader: R,
    inner: Arc<Inner>,
    buffer_size: usize,
    ready: oneshot::Sender<Result<AgentInfo>>,
) where
    R: AsyncRead + Unpin,
{
    let mut ready = Some(ready);
    let mut buf = vec![0u8; buffer_size.max(1)];

    let reason = loop {
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break AgentError::ConnectionClosed,
            res = reader.read(&mut buf) => res,
        };
        let n = match read {
            Ok(0) => break AgentError::ConnectionClosed,
            Ok(n) => n,
            Err(err) => break err.into(),
        };

        let outputs = match inner.feed(&buf[..n]) {
            Ok(outputs) => outputs,
            Err(err) => break err,
        };
        for output in outputs {
            match output {
                EngineOutput::Handshake(info) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(info));
                    }
                }
                EngineOutput::Event(event) => inner.route_event(event, false),
                EngineOutput::LockedEvent(event) => inner.route_event(event, true),
            }
        }
    };

    if let Some(tx) = ready.take() {
        let _ = tx.send(Err(reason.clone()));
    }
    inner.terminate(reason);
}

async fn write_loop<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Vec<u8>>, inner: Arc<Inner>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = writer.write_all(&frame).await {
            inner.terminate(err.into());
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Delivers queued events to subscribers one at a time, evaluating
/// conditions where a breakpoint has one.
async fn dispatch_loop(mut items: mpsc::UnboundedReceiver<Dispatch>, inner: Arc<Inner>) {
    loop {
        let item = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            item = items.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match item {
            Dispatch::Hit(hit) => {
                let decision = match &hit.condition {
                    Some((condition, queue_lock)) => {
                        decide_hit(&queue_lock.bypass(), hit.event, condition).await
                    }
                    None => HitDecision::Stop,
                };
                if decision == HitDecision::Stop {
                    inner.breakpoint_events.publish(&hit.event);
                }
                // Releases the queue lock, if any, after the decision.
                drop(hit);
            }
            Dispatch::Thread(event) => inner.thread_events.publish(&event),
        }
        inner.backlog.fetch_sub(1, Ordering::SeqCst);
    }
}

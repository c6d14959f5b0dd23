//! JSON relay transport.
//!
//! A relay carries the command vocabulary as discrete JSON messages instead
//! of binary frames:
//!
//! - request: `{"requestId": 1, "command": "evaluate", "args": [1, 0, "x"]}`
//! - reply: `{"requestId": 1, ...resultFields}` or `{"requestId": 1, "error": "..."}`
//! - events: `{"breakpoint": {...}}` and `{"threadEvent": {...}}`
//!
//! [`RelayLink`] is the message channel. Over a byte stream it uses one JSON
//! document per line.

use std::collections::HashMap;
use std::future::ready;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tether_wire::sync::MutexExt;
use tether_wire::{BreakpointEvent, Subscribers, ThreadEvent};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::command::{Command, Envelope};
use crate::error::{Result, SessionError};
use crate::{BoxFuture, Session};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub request_id: Value,
    pub command: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Out-of-band event message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelayEvent {
    Breakpoint(BreakpointEvent),
    ThreadEvent(ThreadEvent),
}

pub struct RelayReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> RelayReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Next message, or `None` at end of stream. Blank lines are skipped.
    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

pub struct RelayWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> RelayWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Bidirectional JSON message channel.
#[derive(Debug)]
pub struct RelayLink {
    tx: mpsc::UnboundedSender<Value>,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl RelayLink {
    /// Two connected in-memory ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: b_rx },
            Self { tx: b_tx, rx: a_rx },
        )
    }

    /// Newline-delimited JSON over a byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

        tokio::spawn(async move {
            let mut reader = RelayReader::new(read_half);
            loop {
                match reader.read_value().await {
                    Ok(Some(value)) => {
                        if in_tx.send(value).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(SessionError::Json(err)) => {
                        tracing::warn!(target: "tether.session", error = %err, "skipping malformed relay message");
                    }
                    Err(err) => {
                        tracing::debug!(target: "tether.session", error = %err, "relay stream read failed");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut writer = RelayWriter::new(write_half);
            while let Some(value) = out_rx.recv().await {
                if let Err(err) = writer.write_value(&value).await {
                    tracing::debug!(target: "tether.session", error = %err, "relay stream write failed");
                    break;
                }
            }
        });

        Self {
            tx: out_tx,
            rx: in_rx,
        }
    }

    pub fn send(&self, value: Value) -> bool {
        self.tx.send(value).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Value>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        (self.tx, self.rx)
    }
}

type PendingReply = oneshot::Sender<Result<Envelope>>;

struct Inner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
    outgoing: mpsc::UnboundedSender<Value>,
    breakpoint_events: Subscribers<BreakpointEvent>,
    thread_events: Subscribers<ThreadEvent>,
    closed: CancellationToken,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingReply>> {
        self.pending.lock_or_recover("relay::pending")
    }

    fn handle(&self, message: Value) {
        let Value::Object(mut fields) = message else {
            tracing::warn!(target: "tether.session", %message, "ignoring non-object relay message");
            return;
        };

        if let Some(id) = fields.remove("requestId") {
            let Some(tx) = id.as_u64().and_then(|id| self.pending().remove(&id)) else {
                tracing::warn!(target: "tether.session", request_id = %id, "relay reply for unknown request");
                return;
            };
            let result = match fields.remove("error") {
                None | Some(Value::Null) => Ok(fields),
                Some(Value::String(message)) => Err(SessionError::Relay(message)),
                Some(other) => Err(SessionError::Relay(other.to_string())),
            };
            let _ = tx.send(result);
            return;
        }

        match serde_json::from_value::<RelayEvent>(Value::Object(fields)) {
            Ok(RelayEvent::Breakpoint(event)) => self.breakpoint_events.publish(&event),
            Ok(RelayEvent::ThreadEvent(event)) => self.thread_events.publish(&event),
            Err(err) => {
                tracing::debug!(target: "tether.session", error = %err, "ignoring unrecognized relay message");
            }
        }
    }

    /// Cancels under the `pending` lock, so a request either lands in the
    /// map before the drain or sees the relay closed.
    fn close(&self) {
        let mut pending = self.pending();
        self.closed.cancel();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(SessionError::RelayClosed));
        }
    }
}

/// Requesting side of a relay.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    pub fn new(link: RelayLink) -> Self {
        let (outgoing, incoming) = link.into_parts();
        let inner = Arc::new(Inner {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outgoing,
            breakpoint_events: Subscribers::new(),
            thread_events: Subscribers::new(),
            closed: CancellationToken::new(),
        });
        tokio::spawn(read_loop(inner.clone(), incoming));
        Self { inner }
    }

    pub fn send_message(&self, command: Command, args: Vec<Value>) -> BoxFuture<Result<Envelope>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending();
            if self.inner.closed.is_cancelled() {
                return Box::pin(ready(Err(SessionError::RelayClosed)));
            }
            pending.insert(id, tx);
        }

        let request = json!({ "requestId": id, "command": command, "args": args });
        if self.inner.outgoing.send(request).is_err() {
            self.inner.pending().remove(&id);
            return Box::pin(ready(Err(SessionError::RelayClosed)));
        }
        tracing::debug!(target: "tether.session", request_id = id, %command, "relay request sent");
        Box::pin(async move { rx.await.map_err(|_| SessionError::RelayClosed)? })
    }

    pub fn breakpoint_events(&self) -> &Subscribers<BreakpointEvent> {
        &self.inner.breakpoint_events
    }

    pub fn thread_events(&self) -> &Subscribers<ThreadEvent> {
        &self.inner.thread_events
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    pub fn shutdown(&self) {
        self.inner.close();
    }
}

async fn read_loop(inner: Arc<Inner>, mut incoming: mpsc::UnboundedReceiver<Value>) {
    loop {
        let message = tokio::select! {
            _ = inner.closed.cancelled() => break,
            message = incoming.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        inner.handle(message);
    }
    tracing::debug!(target: "tether.session", "relay closed");
    inner.close();
}

/// Serving side of a relay: executes relay requests against a session and
/// forwards its events out of band.
pub struct RelayServer {
    session: Session,
}

impl RelayServer {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Serve one link until either the link or the session closes.
    pub async fn serve(&self, link: RelayLink) -> Result<()> {
        let (outgoing, mut incoming) = link.into_parts();

        let breakpoints = {
            let outgoing = outgoing.clone();
            self.session
                .breakpoint_events()
                .subscribe(move |event| forward(&outgoing, RelayEvent::Breakpoint(*event)))
        };
        let threads = {
            let outgoing = outgoing.clone();
            self.session
                .thread_events()
                .subscribe(move |event| forward(&outgoing, RelayEvent::ThreadEvent(*event)))
        };

        let closed = self.session.closed_token();
        loop {
            let message = tokio::select! {
                _ = closed.cancelled() => break,
                message = incoming.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.dispatch(message, &outgoing);
        }

        self.session.breakpoint_events().unsubscribe(breakpoints);
        self.session.thread_events().unsubscribe(threads);
        if closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "debug session ended").into());
        }
        Ok(())
    }

    fn dispatch(&self, message: Value, outgoing: &mpsc::UnboundedSender<Value>) {
        let request: RelayRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(target: "tether.session", error = %err, "dropping malformed relay request");
                return;
            }
        };

        // Enqueue now so requests reach the agent in arrival order.
        let reply = match request.command.parse::<Command>() {
            Ok(command) => self.session.send_message(command, request.args),
            Err(err) => Box::pin(ready(Err(err))),
        };
        let outgoing = outgoing.clone();
        let request_id = request.request_id;
        tokio::spawn(async move {
            let message = match reply.await {
                Ok(fields) => {
                    let mut message = Map::new();
                    message.insert("requestId".to_string(), request_id);
                    message.extend(fields);
                    Value::Object(message)
                }
                Err(err) => json!({ "requestId": request_id, "error": err.to_string() }),
            };
            let _ = outgoing.send(message);
        });
    }
}

fn forward(outgoing: &mpsc::UnboundedSender<Value>, event: RelayEvent) {
    match serde_json::to_value(event) {
        Ok(message) => {
            let _ = outgoing.send(message);
        }
        Err(err) => {
            tracing::warn!(target: "tether.session", error = %err, "failed to encode relay event");
        }
    }
}

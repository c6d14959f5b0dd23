//! Command-level debug session.
//!
//! A [`Session`] accepts commands by name with positional JSON arguments and
//! answers with a JSON result map, independent of whether it talks to the
//! agent directly ([`tether_wire::AgentClient`]) or through a JSON relay
//! ([`relay::RelayClient`]). Breakpoint and thread events are delivered to
//! subscribers on either transport.

use std::future::{ready, Future};
use std::net::SocketAddr;
use std::pin::Pin;

use serde_json::Value;
use tether_wire::{AgentClient, AgentClientConfig, BreakpointEvent, Subscribers, ThreadEvent};
use tokio_util::sync::CancellationToken;

pub mod command;
mod direct;
pub mod error;
pub mod relay;

pub use command::{Call, Command, Envelope};
pub use error::{Result, SessionError};
pub use relay::{RelayClient, RelayLink, RelayServer};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

#[derive(Clone)]
enum Backend {
    Direct(AgentClient),
    Relay(RelayClient),
}

#[derive(Clone)]
pub struct Session {
    backend: Backend,
}

impl Session {
    pub fn direct(client: AgentClient) -> Self {
        Self {
            backend: Backend::Direct(client),
        }
    }

    pub fn relay(link: RelayLink) -> Self {
        Self {
            backend: Backend::Relay(RelayClient::new(link)),
        }
    }

    /// Connect straight to an agent.
    pub async fn connect(addr: SocketAddr, config: AgentClientConfig) -> Result<Self> {
        let client = AgentClient::connect_with_config(addr, config).await?;
        Ok(Self::direct(client))
    }

    /// Issue `command`. The request is queued before this returns; awaiting
    /// the future only waits for the reply.
    pub fn send_message(&self, command: Command, args: Vec<Value>) -> BoxFuture<Result<Envelope>> {
        match &self.backend {
            Backend::Direct(client) => match Call::parse(command, &args) {
                Ok(call) => direct::execute(client, call),
                Err(err) => Box::pin(ready(Err(err))),
            },
            Backend::Relay(relay) => relay.send_message(command, args),
        }
    }

    /// [`Session::send_message`] with the command given by name.
    pub fn send(&self, command: &str, args: Vec<Value>) -> BoxFuture<Result<Envelope>> {
        match command.parse::<Command>() {
            Ok(command) => self.send_message(command, args),
            Err(err) => Box::pin(ready(Err(err))),
        }
    }

    pub fn breakpoint_events(&self) -> &Subscribers<BreakpointEvent> {
        match &self.backend {
            Backend::Direct(client) => client.breakpoint_events(),
            Backend::Relay(relay) => relay.breakpoint_events(),
        }
    }

    pub fn thread_events(&self) -> &Subscribers<ThreadEvent> {
        match &self.backend {
            Backend::Direct(client) => client.thread_events(),
            Backend::Relay(relay) => relay.thread_events(),
        }
    }

    /// Cancelled once the underlying connection is gone.
    pub fn closed_token(&self) -> CancellationToken {
        match &self.backend {
            Backend::Direct(client) => client.shutdown_token(),
            Backend::Relay(relay) => relay.closed_token(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed_token().is_cancelled()
    }

    pub fn shutdown(&self) {
        match &self.backend {
            Backend::Direct(client) => client.shutdown(),
            Backend::Relay(relay) => relay.shutdown(),
        }
    }

    /// The agent connection, for sessions that own one.
    pub fn agent(&self) -> Option<&AgentClient> {
        match &self.backend {
            Backend::Direct(client) => Some(client),
            Backend::Relay(_) => None,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transport = match self.backend {
            Backend::Direct(_) => "direct",
            Backend::Relay(_) => "relay",
        };
        f.debug_struct("Session")
            .field("transport", &transport)
            .field("closed", &self.is_closed())
            .finish()
    }
}

use std::io;

use tether_wire::AgentError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Error string reported by the far side of a relay.
    #[error("relay error: {0}")]
    Relay(String),

    #[error("relay connection closed")]
    RelayClosed,

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("invalid arguments for `{command}`: {message}")]
    BadArguments {
        command: &'static str,
        message: String,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Whether the session can no longer be used.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Agent(err) => err.is_fatal(),
            Self::RelayClosed | Self::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

//! `tether.toml` configuration and tracing setup.
//!
//! Every section is optional; a missing file yields [`TetherConfig::default`].
//! Unknown keys are rejected so typos surface instead of being ignored.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_wire::protocol::{DEFAULT_MAX_MESSAGE_LEN, HEADER_LEN};
use tether_wire::AgentClientConfig;
use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Environment variable naming the config file, absolute or relative to the
/// search directory.
pub const CONFIG_ENV_VAR: &str = "TETHER_CONFIG_PATH";

const CONFIG_FILE_NAMES: [&str; 2] = ["tether.toml", ".tether.toml"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Address of the debug agent.
    #[serde(default = "AgentConfig::default_address")]
    pub address: SocketAddr,

    #[serde(default = "AgentConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "AgentConfig::default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Largest message the agent may send, header included.
    #[serde(default = "AgentConfig::default_max_message_len")]
    pub max_message_len: usize,
}

impl AgentConfig {
    fn default_address() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5151))
    }

    fn default_handshake_timeout_ms() -> u64 {
        5_000
    }

    fn default_read_buffer_size() -> usize {
        64 * 1024
    }

    fn default_max_message_len() -> usize {
        DEFAULT_MAX_MESSAGE_LEN
    }

    pub fn client_config(&self) -> AgentClientConfig {
        AgentClientConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            read_buffer_size: self.read_buffer_size,
            max_message_len: self.max_message_len,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            handshake_timeout_ms: Self::default_handshake_timeout_ms(),
            read_buffer_size: Self::default_read_buffer_size(),
            max_message_len: Self::default_max_message_len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Where `tether relay` accepts relay clients.
    #[serde(default = "RelayConfig::default_listen")]
    pub listen: SocketAddr,
}

impl RelayConfig {
    fn default_listen() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5152))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A plain level (`info`, `debug`, ...) or a full `EnvFilter` directive
    /// string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    /// Append logs to this file instead of stderr. If it cannot be opened,
    /// logs go to stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(Self::normalize_level_directives(&self.level)).unwrap_or_else(|_| {
            EnvFilter::default().add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: the configured level with `RUST_LOG` merged on
    /// top when set.
    pub fn env_filter(&self) -> EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        match env_directives {
            Some(env_directives) => {
                let combined = format!(
                    "{},{env_directives}",
                    Self::normalize_level_directives(&self.level)
                );
                EnvFilter::try_new(combined)
                    .or_else(|_| EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default rendering quotes the offending source line.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl TetherConfig {
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: TetherConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "agent.handshake_timeout_ms must be positive".into(),
            ));
        }
        if self.agent.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "agent.read_buffer_size must be positive".into(),
            ));
        }
        if self.agent.max_message_len < HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "agent.max_message_len must be at least {HEADER_LEN}"
            )));
        }
        Ok(())
    }
}

/// Find the config file for `dir`.
///
/// Search order:
/// 1) `TETHER_CONFIG_PATH` (absolute or relative to `dir`)
/// 2) `tether.toml` in `dir`
/// 3) `.tether.toml` in `dir`
pub fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    if let Some(value) = std::env::var_os(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(value);
        return Some(if candidate.is_absolute() {
            candidate
        } else {
            dir.join(candidate)
        });
    }
    CONFIG_FILE_NAMES
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Load an explicitly named config file, or discover one under `dir`.
///
/// An explicit path must exist. Without one, a missing file means defaults.
pub fn load(
    explicit: Option<&Path>,
    dir: &Path,
) -> Result<(TetherConfig, Option<PathBuf>), ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match discover_config_path(dir) {
            Some(path) => path,
            None => return Ok((TetherConfig::default(), None)),
        },
    };
    let config = TetherConfig::load_from_path(&path)?;
    Ok((config, Some(path)))
}

/// Install the global tracing subscriber. Returns `false` if one was already
/// installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let file = config.file.as_ref().and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    let to_file = file.is_some();
    let writer = match file {
        Some(file) => BoxMakeWriter::new(Mutex::new(file)),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(!to_file)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(config.env_filter())
        .try_init()
        .is_ok()
}

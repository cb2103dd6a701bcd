//! Runtime configuration for the signaling server.
//!
//! Settings come from an optional TOML file passed as the first CLI argument;
//! every field has a default so the server runs with no file at all.
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 8787
//! name = "couchcast-signal"
//!
//! [sessions]
//! ttl_secs = 1800
//! sweep_interval_secs = 60
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level signaling server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SignalConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
}

/// Listener and identity settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// IP address to bind the listener to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port for WebSocket connections and the HTTP status endpoint.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name reported by the HTTP status endpoint.
    #[serde(default = "default_name")]
    pub name: String,
}

/// Session garbage-collection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Idle lifetime before a session is collected, in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Spacing between garbage-collection sweeps, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_name() -> String {
    "couchcast-signal".to_string()
}
fn default_ttl_secs() -> u64 {
    30 * 60
}
fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            name: default_name(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SignalConfig {
    /// Loads from `path`, falling back to defaults if the file does not exist.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// `"host:port"` the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.sessions.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.sweep_interval_secs)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Server configuration for graphflow-server.
//!
//! Loads and parses a TOML configuration file, following a
//! `CONFIG_PATH` env var override, then a short list of fallback
//! paths, trimmed to the fields the bootstrap layer needs: bind
//! address, queue mode, and the three execution timeouts/intervals.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::queue::QueueMode;

#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(std::io::Error),
    #[error("failed to parse TOML: {0}")]
    ParseError(toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueModeConfig {
    Fifo,
    SingleFlight,
}

impl From<QueueModeConfig> for QueueMode {
    fn from(value: QueueModeConfig) -> Self {
        match value {
            QueueModeConfig::Fifo => QueueMode::Fifo,
            QueueModeConfig::SingleFlight => QueueMode::SingleFlight,
        }
    }
}

impl Default for QueueModeConfig {
    fn default() -> Self {
        QueueModeConfig::Fifo
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_execution_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_queue_position_interval_secs() -> u64 {
    1
}

fn default_disconnect_poll_interval_ms() -> u64 {
    500
}

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_queue_position_interval_secs")]
    pub queue_position_interval_secs: u64,
    #[serde(default)]
    pub queue_mode: QueueModeConfig,
    #[serde(default = "default_disconnect_poll_interval_ms")]
    pub disconnect_poll_interval_ms: u64,
    /// Illustrative cap on queue-position updates sent per job. Left
    /// unset by default; no code path currently applies it.
    #[serde(default)]
    pub max_queue_position_updates: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            execution_timeout_secs: default_execution_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            queue_position_interval_secs: default_queue_position_interval_secs(),
            queue_mode: QueueModeConfig::default(),
            disconnect_poll_interval_ms: default_disconnect_poll_interval_ms(),
            max_queue_position_updates: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ServerConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ServerConfigError::ReadError)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self, ServerConfigError> {
        toml::from_str(content).map_err(ServerConfigError::ParseError)
    }

    /// Load configuration from `CONFIG_PATH`, or a short list of
    /// fallback paths, or — if none exist — built-in defaults. A
    /// missing config file is not an error: every field here has a
    /// sensible default.
    pub fn load() -> Result<Self, ServerConfigError> {
        if let Ok(config_path) = std::env::var("CONFIG_PATH") {
            return Self::from_file(config_path);
        }

        let paths = [
            PathBuf::from("config/graphflow-server.toml"),
            PathBuf::from("../config/graphflow-server.toml"),
            PathBuf::from("./graphflow-server.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    pub fn execution_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn queue_position_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.queue_position_interval_secs)
    }

    pub fn disconnect_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.disconnect_poll_interval_ms)
    }
}

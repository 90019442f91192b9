//! Configuration for graphflow-server: a `ServerConfig` loaded from
//! TOML (see [`server`]) plus a thin CLI overlay.

pub mod server;

pub use server::{QueueModeConfig, ServerConfig, ServerConfigError};

use clap::Parser;

/// Command-line overlay on top of the TOML configuration. Any flag
/// that is set overrides the corresponding config field.
#[derive(Debug, Parser)]
#[command(name = "graphflow-server", about = "Execution control plane for streaming graph runs")]
pub struct Cli {
    /// Path to a TOML config file (same effect as CONFIG_PATH).
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the bind host.
    #[arg(long)]
    pub host: Option<String>,
}

impl Cli {
    /// Loads `ServerConfig` per its own search order, then applies any
    /// CLI overrides on top. Config load failures surface as
    /// [`crate::CoreError::Config`], the crate-level error the bootstrap
    /// layer (`src/bin/graphflow-server.rs`) propagates out of `main`.
    pub fn resolve(&self) -> crate::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::load()?,
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        Ok(config)
    }
}

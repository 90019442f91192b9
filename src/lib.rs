//! graphflow-server: execution control plane for streaming, cancellable
//! graph runs over a persistent connection.
//!
//! The core is five components, leaves first: the message [`codec`], the
//! [`credentials`] gate, the connection [`session`] registry, the
//! [`queue`] that schedules jobs one at a time, and the [`worker`] that
//! drives external graph execution. The [`graph`] module defines the
//! external graph-executor contract plus a minimal reference
//! implementation. [`api`] wires all of it to an axum WebSocket route.

pub mod api;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod graph;
pub mod queue;
pub mod session;
pub mod signal;
pub mod worker;

use thiserror::Error;

/// Crate-level error for failures that are not already expressed as
/// wire-level `error` frames: startup, configuration, and internal
/// invariant violations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ServerConfigError),

    #[error("queue is shutting down")]
    QueueShuttingDown,

    #[error("queue is busy (single-flight mode)")]
    QueueBusy,

    #[error("session {0} is not registered")]
    UnknownSession(uuid::Uuid),

    #[error("socket bind failed: {0}")]
    Bind(#[source] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Crate version, as reported by the `/healthz` endpoint.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

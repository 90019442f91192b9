//! HTTP/WebSocket surface: a single `/execute` upgrade route plus a
//! health check, sharing one `AppState` of registry, queue, and
//! credential-gate collaborators.

pub mod middleware;
pub mod ws;

pub use middleware::cors_layer;
pub use ws::ws_handler;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::Json;
use axum::Router;

use crate::config::ServerConfig;
use crate::credentials::{CredentialStore, NodeRegistry};
use crate::queue::ExecutionQueue;
use crate::session::ConnectionRegistry;

/// Shared state handed to every route. Cloning is cheap: every field
/// is already an `Arc` (or, for `started_at`, `Copy`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub queue: Arc<ExecutionQueue>,
    pub node_registry: Arc<dyn NodeRegistry>,
    pub credential_store: Arc<dyn CredentialStore>,
    pub started_at: Instant,
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": crate::version(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/execute", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(middleware::logging_layer())
        .layer(cors_layer())
        .with_state(state)
}

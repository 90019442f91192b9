//! graphflow-server binary: bootstraps configuration, wires the
//! registry/queue/worker, and serves the `/execute` WebSocket route.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use graphflow_server::api::{create_router, AppState};
use graphflow_server::config::Cli;
use graphflow_server::credentials::{EnvCredentialStore, InMemoryNodeRegistry};
use graphflow_server::graph::SequentialGraphExecutorFactory;
use graphflow_server::queue::ExecutionQueue;
use graphflow_server::session::ConnectionRegistry;
use graphflow_server::worker::{ExecutionWorker, WorkerConfig};
use graphflow_server::CoreError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let cli = Cli::parse();
    let config = cli.resolve()?;
    tracing::info!(host = %config.host, port = config.port, queue_mode = ?config.queue_mode, "configuration loaded");

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let queue = ExecutionQueue::new(config.queue_mode.into(), config.queue_position_interval());
    let registry = Arc::new(ConnectionRegistry::new());
    let node_registry = Arc::new(InMemoryNodeRegistry::new());
    let credential_store = Arc::new(EnvCredentialStore::new());

    let worker = Arc::new(ExecutionWorker::new(
        queue.clone(),
        node_registry.clone(),
        credential_store.clone(),
        Arc::new(SequentialGraphExecutorFactory),
        WorkerConfig {
            execution_timeout: config.execution_timeout(),
            disconnect_poll_interval: Some(config.disconnect_poll_interval()),
        },
    ));
    let worker_handle = tokio::spawn(worker.run());

    let state = AppState {
        config: Arc::new(config),
        registry,
        queue: queue.clone(),
        node_registry,
        credential_store,
        started_at: std::time::Instant::now(),
    };
    let app = create_router(state);

    tracing::info!(%addr, "starting graphflow-server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(CoreError::Bind)?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.shutdown();
    let _ = worker_handle.await;
    tracing::info!("graphflow-server shut down gracefully");
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL-C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received CTRL-C signal, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM signal, shutting down");
        }
    }
}

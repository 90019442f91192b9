//! The `/execute` WebSocket route: wires the codec, credential gate,
//! connection registry, and execution queue together for one socket.
//!
//! Builds on the placeholder `ws_handler` shape (same axum upgrade
//! flow) generalized into an actual per-connection read loop,
//! with the connection abstraction required by [`crate::session`]
//! implemented over a writer task fed by a bounded channel so critical
//! and best-effort sends never fight over a single `SplitSink` lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::codec::{self, ErrorCode, InboundFrame};
use crate::credentials;
use crate::queue::JobState;
use crate::session::Connection;

const WRITER_CHANNEL_CAPACITY: usize = 256;
const CRITICAL_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A `Connection` backed by a channel into a dedicated writer task
/// that owns the actual socket sink. Lets worker, ticker, and handler
/// tasks all send concurrently without a send-side lock.
pub struct WsConnection {
    id: Uuid,
    tx: mpsc::Sender<Message>,
    closed: AtomicBool,
}

impl WsConnection {
    fn new(tx: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            tx,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_critical(&self, frame: codec::OutboundFrame) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let message = Message::Text(frame.to_json_string());
        match tokio::time::timeout(CRITICAL_SEND_TIMEOUT, self.tx.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!(connection = %self.id, "send_critical: writer channel closed");
                self.closed.store(true, Ordering::SeqCst);
            }
            Err(_) => {
                warn!(connection = %self.id, "send_critical: timed out waiting for writer capacity");
            }
        }
    }

    fn send_best_effort(&self, frame: codec::OutboundFrame) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let message = Message::Text(frame.to_json_string());
        if self.tx.try_send(message).is_err() {
            debug!(connection = %self.id, "send_best_effort: dropped, writer buffer full or closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(connection = %self.id, reason, "connection closed");
        // Dropping the sender ends the writer task; the socket close
        // frame follows naturally when the write loop exits.
    }
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(WRITER_CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let connection = WsConnection::new(tx);

    let first_frame = tokio::time::timeout(state.config.connect_timeout(), stream.next()).await;
    let first_text = match first_frame {
        Ok(Some(Ok(Message::Text(text)))) => Some(text),
        Ok(Some(Ok(_))) => None,
        Ok(Some(Err(_))) | Ok(None) => {
            connection.close("read error before connect");
            let _ = writer.await;
            return;
        }
        Err(_) => {
            connection
                .send_critical(codec::build_error(
                    "Connect timeout",
                    Some(ErrorCode::ValidationError),
                    None,
                    None,
                ))
                .await;
            connection.close("connect timeout");
            let _ = writer.await;
            return;
        }
    };

    let session_id = match first_text.as_deref().map(codec::parse) {
        Some(Some(InboundFrame::Connect { session_id: requested })) => {
            let id = state.registry.establish(connection.clone(), requested).await;
            info!(session = %id, "session established");
            id
        }
        _ => {
            connection
                .send_critical(codec::build_error(
                    "First frame must be connect",
                    Some(ErrorCode::ValidationError),
                    None,
                    None,
                ))
                .await;
            connection.close("protocol violation: first frame was not connect");
            let _ = writer.await;
            return;
        }
    };

    while let Some(message) = stream.next().await {
        let Ok(message) = message else { break };
        let Message::Text(text) = message else { continue };

        match codec::parse(&text) {
            Some(InboundFrame::Connect { .. }) => {
                connection
                    .send_critical(codec::build_error(
                        "already connected",
                        Some(ErrorCode::ValidationError),
                        None,
                        None,
                    ))
                    .await;
            }
            Some(InboundFrame::Graph { graph_data }) => {
                handle_graph_frame(&state, session_id, &connection, graph_data).await;
            }
            Some(InboundFrame::Stop) => {
                handle_stop_frame(&state, session_id, &connection).await;
            }
            Some(InboundFrame::Ping) => {
                connection.send_critical(codec::build_pong()).await;
            }
            None => {
                // Malformed or unrecognized subsequent frame: ignored
                // silently; only the first frame's violation gets a
                // reply.
                debug!(session = %session_id, "ignoring unparseable frame");
            }
        }
    }

    let connection_as_trait: Arc<dyn Connection> = connection.clone();
    state.registry.unregister(session_id, &connection_as_trait);
    connection.close("socket closed");
    let _ = writer.await;
}

async fn handle_graph_frame(
    state: &AppState,
    session_id: Uuid,
    connection: &Arc<WsConnection>,
    graph_data: serde_json::Value,
) {
    let required = credentials::required_keys(&graph_data, state.node_registry.as_ref());
    let missing = credentials::missing(&required, state.credential_store.as_ref());
    if !missing.is_empty() {
        connection
            .send_critical(codec::build_error(
                "Missing required credentials",
                Some(ErrorCode::MissingApiKeys),
                Some(missing),
                None,
            ))
            .await;
        return;
    }

    let connection_as_trait: Arc<dyn Connection> = connection.clone();
    match state.queue.enqueue(connection_as_trait, graph_data).await {
        Ok(job) => {
            state.registry.set_job(session_id, Some(job));
        }
        Err(_busy) => {
            connection
                .send_critical(codec::build_error(
                    "A job is already running for this session",
                    Some(ErrorCode::ValidationError),
                    None,
                    None,
                ))
                .await;
        }
    }
}

async fn handle_stop_frame(state: &AppState, session_id: Uuid, connection: &Arc<WsConnection>) {
    let Some(job) = state.registry.get_job(session_id) else {
        connection.send_critical(codec::build_stopped("No active job", None)).await;
        return;
    };

    if job.state() == JobState::Done {
        connection
            .send_critical(codec::build_stopped("Job already stopped", Some(job.id)))
            .await;
        return;
    }

    let resolved_here = state.queue.cancel(&job);
    if resolved_here {
        // The job was still pending: no worker will ever see it, so
        // this handler owns the confirmation. A running job's
        // `stopped` frame is sent by the worker during its own
        // teardown.
        connection
            .send_critical(codec::build_stopped("Job stopped", Some(job.id)))
            .await;
    }
}

//! Execution Worker (spec §4.5): the single long-running task that
//! owns the `running` slot and drives one job at a time through the
//! external graph executor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::codec::{self, ErrorCode, StatusState};
use crate::credentials::{CredentialStore, NodeRegistry};
use crate::graph::{ExecutorCallbacks, GraphError, GraphExecutorFactory, NodeOutput, ProgressEvent, ResultMap};
use crate::queue::{ExecutionQueue, Job};
use crate::session::Connection;

/// Forwards progress/result callbacks from the executor straight to
/// the job's currently-bound connection, tracking which node_ids have
/// already been emitted via the immediate-result path so the final
/// batch does not re-send them.
struct ForwardingCallbacks {
    job: Arc<Job>,
    emitted: parking_lot::Mutex<HashSet<String>>,
}

impl ExecutorCallbacks for ForwardingCallbacks {
    fn on_progress(&self, event: ProgressEvent) {
        let frame = codec::build_progress(
            event.node_id,
            event.state,
            self.job.id,
            event.progress,
            event.text,
            event.meta,
        );
        self.job.connection().send_best_effort(frame);
    }

    fn on_result(&self, node_id: &str, output: NodeOutput) {
        self.emitted.lock().insert(node_id.to_string());
        let mut results = std::collections::HashMap::new();
        results.insert(node_id.to_string(), output);
        let frame = codec::build_data(results, self.job.id);
        self.job.connection().send_best_effort(frame);
    }
}

pub struct WorkerConfig {
    pub execution_timeout: Duration,
    pub disconnect_poll_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(300),
            disconnect_poll_interval: Some(Duration::from_millis(500)),
        }
    }
}

pub struct ExecutionWorker {
    queue: Arc<ExecutionQueue>,
    node_registry: Arc<dyn NodeRegistry>,
    credential_store: Arc<dyn CredentialStore>,
    executor_factory: Arc<dyn GraphExecutorFactory>,
    config: WorkerConfig,
}

enum Resolution {
    Completed(Result<ResultMap, GraphError>),
    UserCancelled,
    Disconnected,
    TimedOut,
}

impl ExecutionWorker {
    pub fn new(
        queue: Arc<ExecutionQueue>,
        node_registry: Arc<dyn NodeRegistry>,
        credential_store: Arc<dyn CredentialStore>,
        executor_factory: Arc<dyn GraphExecutorFactory>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            node_registry,
            credential_store,
            executor_factory,
            config,
        }
    }

    /// Runs until the queue shuts down. Each job is handled in its own
    /// spawned task so a panic inside `handle_job` is caught at this
    /// loop boundary rather than killing the worker (spec §7: "worker
    /// panic... caught at the outermost loop boundary").
    pub async fn run(self: Arc<Self>) {
        loop {
            let job = match self.queue.next().await {
                Some(job) => job,
                None => {
                    info!("execution queue shut down, worker exiting");
                    return;
                }
            };

            let worker = self.clone();
            let job_for_panic = job.clone();
            let outcome = tokio::spawn(async move { worker.handle_job(job).await }).await;

            if let Err(join_err) = outcome {
                error!(job_id = job_for_panic.id, error = %join_err, "worker panicked handling job");
                self.queue.mark_done(&job_for_panic);
            }
        }
    }

    async fn handle_job(&self, job: Arc<Job>) {
        if job.connection().is_closed() {
            info!(job_id = job.id, "connection closed before job started, skipping");
            self.queue.mark_done(&job);
            return;
        }

        // Wait for the position ticker to send its final queue_position
        // (ending at 0) and stop before announcing `running`, so the two
        // independently-scheduled tasks never race onto the wire out of
        // order (spec §8).
        job.ticker_done().await;

        job.connection()
            .send_critical(codec::build_status(StatusState::Running, "running", job.id))
            .await;

        if job.cancel_signal.is_fired() {
            // Cancelled in the narrow window between queue.next() and
            // here; never start the external executor (spec §4.4
            // ordering guarantee).
            self.finish_user_cancel(&job).await;
            self.queue.mark_done(&job);
            return;
        }

        let callbacks = Arc::new(ForwardingCallbacks {
            job: job.clone(),
            emitted: parking_lot::Mutex::new(HashSet::new()),
        });
        let executor = self.executor_factory.create(
            job.graph.clone(),
            self.node_registry.clone(),
            self.credential_store.clone(),
            callbacks.clone(),
        );

        let resolution = self.race(&job, executor.as_ref()).await;

        match resolution {
            Resolution::Completed(Ok(results)) => {
                self.finish_completed(&job, results, &callbacks.emitted.lock()).await;
            }
            Resolution::Completed(Err(err)) => {
                executor.force_stop("error");
                let code = match err {
                    GraphError::Invalid(_) => ErrorCode::ValidationError,
                    GraphError::NodeFailed { .. } => ErrorCode::ExecutionError,
                };
                self.finish_error(&job, &err.to_string(), code).await;
            }
            Resolution::UserCancelled => {
                executor.force_stop("user");
                self.finish_user_cancel(&job).await;
            }
            Resolution::Disconnected => {
                executor.force_stop("disconnect");
                debug!(job_id = job.id, "job cancelled due to disconnect, no outbound message");
            }
            Resolution::TimedOut => {
                executor.force_stop("timeout");
                let secs = self.config.execution_timeout.as_secs();
                self.finish_error(
                    &job,
                    &format!("Execution timed out after {secs} seconds"),
                    ErrorCode::ExecutionError,
                )
                .await;
            }
        }

        self.queue.mark_done(&job);
    }

    async fn race(&self, job: &Arc<Job>, executor: &dyn crate::graph::GraphExecutor) -> Resolution {
        let completion = executor.execute();
        let cancelled = job.cancel_signal.wait();
        let timeout = tokio::time::sleep(self.config.execution_timeout);

        match self.config.disconnect_poll_interval {
            Some(interval) => {
                let connection = job.connection();
                let disconnect_watch = async {
                    loop {
                        tokio::time::sleep(interval).await;
                        if connection.is_closed() {
                            return;
                        }
                    }
                };
                tokio::select! {
                    result = completion => Resolution::Completed(result),
                    _ = cancelled => Resolution::UserCancelled,
                    _ = timeout => Resolution::TimedOut,
                    _ = disconnect_watch => Resolution::Disconnected,
                }
            }
            None => {
                tokio::select! {
                    result = completion => Resolution::Completed(result),
                    _ = cancelled => Resolution::UserCancelled,
                    _ = timeout => Resolution::TimedOut,
                }
            }
        }
    }

    async fn finish_completed(&self, job: &Arc<Job>, results: ResultMap, emitted: &HashSet<String>) {
        let connection = job.connection();
        if connection.is_closed() {
            return;
        }

        let remaining: std::collections::HashMap<String, NodeOutput> = results
            .into_iter()
            .filter(|(node_id, _)| !emitted.contains(node_id))
            .collect();

        connection
            .send_critical(codec::build_data(remaining, job.id))
            .await;
        connection
            .send_critical(codec::build_status(StatusState::Finished, "finished", job.id))
            .await;
    }

    async fn finish_user_cancel(&self, job: &Arc<Job>) {
        let connection = job.connection();
        if connection.is_closed() {
            return;
        }
        connection
            .send_critical(codec::build_stopped("Job stopped", Some(job.id)))
            .await;
    }

    async fn finish_error(&self, job: &Arc<Job>, message: &str, code: ErrorCode) {
        let connection = job.connection();
        connection
            .send_critical(codec::build_error(message, Some(code), None, Some(job.id)))
            .await;
        connection
            .send_critical(codec::build_status(StatusState::Error, message, job.id))
            .await;
        warn!(job_id = job.id, message, ?code, "job finished in error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OutboundFrame;
    use crate::credentials::{EnvCredentialStore, InMemoryNodeRegistry};
    use crate::graph::{GraphExecutor, SequentialGraphExecutorFactory};
    use crate::queue::QueueMode;
    use crate::session::test_support::MockConnection;
    use serde_json::json;

    fn worker(queue: Arc<ExecutionQueue>, config: WorkerConfig) -> Arc<ExecutionWorker> {
        Arc::new(ExecutionWorker::new(
            queue,
            Arc::new(InMemoryNodeRegistry::new()),
            Arc::new(EnvCredentialStore::new()),
            Arc::new(SequentialGraphExecutorFactory),
            config,
        ))
    }

    #[tokio::test]
    async fn happy_path_emits_expected_frame_sequence() {
        let queue = ExecutionQueue::new(QueueMode::Fifo, Duration::from_millis(10));
        let connection = MockConnection::new();
        let job = queue
            .enqueue(connection.clone(), json!({"nodes": [{"id": "n1", "type": "io"}]}))
            .await
            .unwrap();

        let w = worker(queue.clone(), WorkerConfig {
            execution_timeout: Duration::from_secs(5),
            disconnect_poll_interval: None,
        });
        let run_handle = tokio::spawn(w.run());

        job.done_signal.wait().await;
        queue.shutdown();
        let _ = run_handle.await;

        let sent = connection.sent.read();
        let kinds: Vec<&'static str> = sent
            .iter()
            .map(|f| match f {
                OutboundFrame::Status { .. } => "status",
                OutboundFrame::QueuePosition { .. } => "queue_position",
                OutboundFrame::Progress { .. } => "progress",
                OutboundFrame::Data { .. } => "data",
                OutboundFrame::Stopped { .. } => "stopped",
                OutboundFrame::Error { .. } => "error",
                OutboundFrame::Session { .. } => "session",
                OutboundFrame::Pong => "pong",
            })
            .collect();

        assert!(kinds.contains(&"status"));
        assert!(kinds.contains(&"data"));

        // spec §8: queue_position ends at 0 strictly before status{running}.
        let last_queue_position = kinds.iter().rposition(|k| *k == "queue_position");
        let first_running = sent.iter().position(|f| {
            matches!(f, OutboundFrame::Status { state: StatusState::Running, .. })
        });
        if let (Some(last_qp), Some(first_running)) = (last_queue_position, first_running) {
            assert!(
                last_qp < first_running,
                "last queue_position ({last_qp}) must precede status{{running}} ({first_running})"
            );
        }
        assert_eq!(kinds.last(), Some(&"status"));
    }

    #[tokio::test]
    async fn execution_timeout_emits_error_then_status_error() {
        let queue = ExecutionQueue::new(QueueMode::Fifo, Duration::from_millis(10));
        let connection = MockConnection::new();
        // A graph with no "nodes" array makes the reference executor
        // return an error instantly; use a custom factory instead to
        // simulate a hang for the timeout path.
        struct HangingExecutor;
        #[async_trait::async_trait]
        impl GraphExecutor for HangingExecutor {
            async fn execute(&self) -> Result<ResultMap, GraphError> {
                std::future::pending().await
            }
            fn force_stop(&self, _reason: &str) {}
        }
        struct HangingFactory;
        impl GraphExecutorFactory for HangingFactory {
            fn create(
                &self,
                _graph: serde_json::Value,
                _node_registry: Arc<dyn NodeRegistry>,
                _credential_store: Arc<dyn CredentialStore>,
                _callbacks: Arc<dyn ExecutorCallbacks>,
            ) -> Arc<dyn GraphExecutor> {
                Arc::new(HangingExecutor)
            }
        }

        let job = queue.enqueue(connection.clone(), json!({})).await.unwrap();
        let w = Arc::new(ExecutionWorker::new(
            queue.clone(),
            Arc::new(InMemoryNodeRegistry::new()),
            Arc::new(EnvCredentialStore::new()),
            Arc::new(HangingFactory),
            WorkerConfig {
                execution_timeout: Duration::from_millis(20),
                disconnect_poll_interval: None,
            },
        ));
        let run_handle = tokio::spawn(w.run());

        job.done_signal.wait().await;
        queue.shutdown();
        let _ = run_handle.await;

        let sent = connection.sent.read();
        let has_error = sent.iter().any(|f| matches!(f, OutboundFrame::Error { .. }));
        assert!(has_error);
        assert!(matches!(sent.last(), Some(OutboundFrame::Status { state: StatusState::Error, .. })));
    }

    #[tokio::test]
    async fn cancel_before_execution_starts_sends_stopped_not_finished() {
        let queue = ExecutionQueue::new(QueueMode::Fifo, Duration::from_millis(10));
        let connection = MockConnection::new();
        let job = queue
            .enqueue(connection.clone(), json!({"nodes": []}))
            .await
            .unwrap();

        job.cancel_signal.fire();
        job.cancel_signal.fire(); // already fired before worker even pulls it

        let w = worker(queue.clone(), WorkerConfig {
            execution_timeout: Duration::from_secs(5),
            disconnect_poll_interval: None,
        });
        let run_handle = tokio::spawn(w.run());
        job.done_signal.wait().await;
        queue.shutdown();
        let _ = run_handle.await;

        let sent = connection.sent.read();
        assert!(sent.iter().any(|f| matches!(f, OutboundFrame::Stopped { .. })));
        assert!(!sent.iter().any(|f| matches!(f, OutboundFrame::Status { state: StatusState::Finished, .. })));
    }

    #[tokio::test]
    async fn invalid_graph_reports_validation_error_not_execution_error() {
        let queue = ExecutionQueue::new(QueueMode::Fifo, Duration::from_millis(10));
        let connection = MockConnection::new();
        // No "nodes" array: the reference executor's validator rejects
        // this immediately with `GraphError::Invalid`.
        let job = queue.enqueue(connection.clone(), json!({})).await.unwrap();

        let w = worker(queue.clone(), WorkerConfig {
            execution_timeout: Duration::from_secs(5),
            disconnect_poll_interval: None,
        });
        let run_handle = tokio::spawn(w.run());
        job.done_signal.wait().await;
        queue.shutdown();
        let _ = run_handle.await;

        let sent = connection.sent.read();
        let error_code = sent.iter().find_map(|f| match f {
            OutboundFrame::Error { code, .. } => Some(*code),
            _ => None,
        });
        assert_eq!(error_code, Some(Some(ErrorCode::ValidationError)));
    }
}

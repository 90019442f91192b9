//! End-to-end scenarios over the registry/queue/worker trio, using a
//! recording `Connection` in place of a real socket and the reference
//! sequential executor in place of a real graph engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;

use graphflow_server::codec::OutboundFrame;
use graphflow_server::credentials::{CredentialStore, EnvCredentialStore, InMemoryNodeRegistry};
use graphflow_server::graph::SequentialGraphExecutorFactory;
use graphflow_server::queue::{ExecutionQueue, QueueMode};
use graphflow_server::session::{Connection, ConnectionRegistry};
use graphflow_server::worker::{ExecutionWorker, WorkerConfig};

struct RecordingConnection {
    sent: RwLock<Vec<OutboundFrame>>,
    closed: AtomicBool,
}

impl RecordingConnection {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.sent
            .read()
            .iter()
            .map(|f| match f {
                OutboundFrame::Session { .. } => "session",
                OutboundFrame::Status { .. } => "status",
                OutboundFrame::QueuePosition { .. } => "queue_position",
                OutboundFrame::Progress { .. } => "progress",
                OutboundFrame::Data { .. } => "data",
                OutboundFrame::Stopped { .. } => "stopped",
                OutboundFrame::Error { .. } => "error",
                OutboundFrame::Pong => "pong",
            })
            .collect()
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn send_critical(&self, frame: OutboundFrame) {
        self.sent.write().push(frame);
    }
    fn send_best_effort(&self, frame: OutboundFrame) {
        self.sent.write().push(frame);
    }
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
    fn close(&self, _reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn spawn_worker(queue: Arc<ExecutionQueue>, config: WorkerConfig) -> tokio::task::JoinHandle<()> {
    let worker = Arc::new(ExecutionWorker::new(
        queue,
        Arc::new(InMemoryNodeRegistry::new()),
        Arc::new(EnvCredentialStore::new()),
        Arc::new(SequentialGraphExecutorFactory),
        config,
    ));
    tokio::spawn(worker.run())
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        execution_timeout: Duration::from_secs(5),
        disconnect_poll_interval: None,
    }
}

#[tokio::test]
async fn happy_path_runs_graph_to_completion() {
    let queue = ExecutionQueue::new(QueueMode::Fifo, Duration::from_millis(10));
    let connection = RecordingConnection::new();
    let job = queue
        .enqueue(
            connection.clone(),
            json!({"nodes": [{"id": "n1", "type": "io"}, {"id": "n2", "type": "compute"}]}),
        )
        .await
        .unwrap();

    let handle = spawn_worker(queue.clone(), fast_config());
    job.done_signal.wait().await;
    queue.shutdown();
    let _ = handle.await;

    let kinds = connection.kinds();
    assert!(kinds.contains(&"status"));
    assert!(kinds.contains(&"data"));
    assert_eq!(kinds.last(), Some(&"status"));
    assert!(!kinds.contains(&"error"));
}

#[tokio::test]
async fn mid_run_cancel_sends_stopped_not_finished() {
    let queue = ExecutionQueue::new(QueueMode::Fifo, Duration::from_millis(10));
    let connection = RecordingConnection::new();
    // Many nodes, so there's a window to cancel before execute() resolves.
    let nodes: Vec<_> = (0..20).map(|i| json!({"id": format!("n{i}"), "type": "compute"})).collect();
    let job = queue.enqueue(connection.clone(), json!({"nodes": nodes})).await.unwrap();

    let handle = spawn_worker(queue.clone(), fast_config());

    // Wait until the job is actually running, then cancel it.
    while job.state() != graphflow_server::queue::JobState::Running {
        tokio::task::yield_now().await;
    }
    let resolved_by_caller = queue.cancel(&job);
    assert!(!resolved_by_caller, "a running job's cancel is owned by the worker");

    job.done_signal.wait().await;
    queue.shutdown();
    let _ = handle.await;

    let kinds = connection.kinds();
    assert!(kinds.contains(&"stopped"));
    assert!(connection
        .sent
        .read()
        .iter()
        .all(|f| !matches!(f, OutboundFrame::Status { state: graphflow_server::codec::StatusState::Finished, .. })));
}

#[tokio::test]
async fn reconnect_rebinds_job_output_to_new_connection() {
    let queue = ExecutionQueue::new(QueueMode::Fifo, Duration::from_secs(5));
    let registry = Arc::new(ConnectionRegistry::new());

    let conn_a = RecordingConnection::new();
    let session_id = registry.establish(conn_a.clone(), None).await;

    let job = queue.enqueue(conn_a.clone(), json!({"nodes": []})).await.unwrap();
    registry.set_job(session_id, Some(job.clone()));

    let conn_b = RecordingConnection::new();
    registry.register(session_id, conn_b.clone()).await;

    assert!(conn_a.is_closed());
    assert!(Arc::ptr_eq(&job.connection(), &(conn_b.clone() as Arc<dyn Connection>)));

    let handle = spawn_worker(queue.clone(), fast_config());
    job.done_signal.wait().await;
    queue.shutdown();
    let _ = handle.await;

    // All output went to the new connection, none to the old one post-swap.
    assert!(conn_b.kinds().contains(&"status"));
}

#[tokio::test]
async fn missing_credentials_are_reported_before_enqueue() {
    struct EmptyCredentialStore;
    impl CredentialStore for EmptyCredentialStore {
        fn get(&self, _key: &str) -> Option<String> {
            None
        }
    }

    let mut node_registry = InMemoryNodeRegistry::new();
    node_registry.register("openai", vec!["OPENAI_API_KEY".to_string()], false);

    let graph = json!({"nodes": [{"id": "n1", "type": "openai"}]});
    let required = graphflow_server::credentials::required_keys(&graph, &node_registry);
    let missing = graphflow_server::credentials::missing(&required, &EmptyCredentialStore);

    assert_eq!(missing, vec!["OPENAI_API_KEY".to_string()]);
}

#[tokio::test]
async fn fifo_queue_runs_jobs_in_submission_order() {
    let queue = ExecutionQueue::new(QueueMode::Fifo, Duration::from_millis(10));
    let conn1 = RecordingConnection::new();
    let conn2 = RecordingConnection::new();

    let job1 = queue.enqueue(conn1.clone(), json!({"nodes": []})).await.unwrap();
    let job2 = queue.enqueue(conn2.clone(), json!({"nodes": []})).await.unwrap();
    assert_eq!(queue.position(&job1), 1);
    assert_eq!(queue.position(&job2), 2);

    let handle = spawn_worker(queue.clone(), fast_config());
    job1.done_signal.wait().await;
    job2.done_signal.wait().await;
    queue.shutdown();
    let _ = handle.await;

    assert!(job2.id > job1.id);
}

#[tokio::test]
async fn execution_timeout_reports_error_then_status() {
    struct HangingExecutor;
    #[async_trait]
    impl graphflow_server::graph::GraphExecutor for HangingExecutor {
        async fn execute(&self) -> Result<graphflow_server::graph::ResultMap, graphflow_server::graph::GraphError> {
            std::future::pending().await
        }
        fn force_stop(&self, _reason: &str) {}
    }
    struct HangingFactory;
    impl graphflow_server::graph::GraphExecutorFactory for HangingFactory {
        fn create(
            &self,
            _graph: serde_json::Value,
            _node_registry: Arc<dyn graphflow_server::credentials::NodeRegistry>,
            _credential_store: Arc<dyn CredentialStore>,
            _callbacks: Arc<dyn graphflow_server::graph::ExecutorCallbacks>,
        ) -> Arc<dyn graphflow_server::graph::GraphExecutor> {
            Arc::new(HangingExecutor)
        }
    }

    let queue = ExecutionQueue::new(QueueMode::Fifo, Duration::from_millis(10));
    let connection = RecordingConnection::new();
    let job = queue.enqueue(connection.clone(), json!({})).await.unwrap();

    let worker = Arc::new(ExecutionWorker::new(
        queue.clone(),
        Arc::new(InMemoryNodeRegistry::new()),
        Arc::new(EnvCredentialStore::new()),
        Arc::new(HangingFactory),
        WorkerConfig {
            execution_timeout: Duration::from_millis(20),
            disconnect_poll_interval: None,
        },
    ));
    let handle = tokio::spawn(worker.run());

    job.done_signal.wait().await;
    queue.shutdown();
    let _ = handle.await;

    let kinds = connection.kinds();
    assert!(kinds.contains(&"error"));
    assert_eq!(kinds.last(), Some(&"status"));
}

//! External graph-executor contract (spec §6) and a minimal reference
//! implementation.
//!
//! The real node registry and graph executor are out of scope for this
//! crate — they are an external library the worker drives through this
//! trait. [`SequentialGraphExecutor`] below is not that library: it is
//! a sequential JSON-node walker sufficient to exercise the control
//! plane end to end in tests and standalone runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::credentials::CredentialStore;
use crate::credentials::NodeRegistry;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub node_id: String,
    pub state: crate::codec::ProgressState,
    pub progress: Option<u8>,
    pub text: Option<String>,
    pub meta: Option<Value>,
}

/// Per-node output, keyed by output name.
pub type NodeOutput = HashMap<String, Value>;
/// Final result map: node_id -> its outputs.
pub type ResultMap = HashMap<String, NodeOutput>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("invalid graph: {0}")]
    Invalid(String),
    #[error("node {node_id} failed: {message}")]
    NodeFailed { node_id: String, message: String },
}

/// Progress/result fan-out, in place of the source's closures (design
/// note: "callback-based progress/result fan-out -> channel or
/// visitor interface").
pub trait ExecutorCallbacks: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
    /// IO-category nodes emit their output the moment they complete,
    /// ahead of the final result batch.
    fn on_result(&self, node_id: &str, output: NodeOutput);
}

/// The external graph executor contract (spec §6), exactly as named
/// there: `create`, `set_progress_callback`/`set_result_callback`
/// (folded here into a single callbacks object wired at construction),
/// `execute`, `force_stop`.
#[async_trait]
pub trait GraphExecutor: Send + Sync {
    async fn execute(&self) -> Result<ResultMap, GraphError>;

    /// Idempotent: safe to call even after execution has completed.
    fn force_stop(&self, reason: &str);
}

/// Factory seam the worker uses to build an executor per job, matching
/// `create(graph, node_registry, credential_store) -> executor`.
pub trait GraphExecutorFactory: Send + Sync {
    fn create(
        &self,
        graph: Value,
        node_registry: Arc<dyn NodeRegistry>,
        credential_store: Arc<dyn CredentialStore>,
        callbacks: Arc<dyn ExecutorCallbacks>,
    ) -> Arc<dyn GraphExecutor>;
}

/// A sequential, dependency-order walker over a `{nodes: [...], edges:
/// [...]}` graph. Every node is "IO category" (its output is emitted
/// immediately via `on_result`) unless the node registry says
/// otherwise. Not a real execution engine: each node resolves to a
/// placeholder output after a short simulated delay.
pub struct SequentialGraphExecutor {
    graph: Value,
    node_registry: Arc<dyn NodeRegistry>,
    callbacks: Arc<dyn ExecutorCallbacks>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

#[derive(Default)]
pub struct SequentialGraphExecutorFactory;

impl GraphExecutorFactory for SequentialGraphExecutorFactory {
    fn create(
        &self,
        graph: Value,
        node_registry: Arc<dyn NodeRegistry>,
        _credential_store: Arc<dyn CredentialStore>,
        callbacks: Arc<dyn ExecutorCallbacks>,
    ) -> Arc<dyn GraphExecutor> {
        Arc::new(SequentialGraphExecutor {
            graph,
            node_registry,
            callbacks,
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }
}

impl SequentialGraphExecutor {
    fn node_ids(&self) -> Result<Vec<String>, GraphError> {
        let nodes = self
            .graph
            .get("nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| GraphError::Invalid("graph is missing a \"nodes\" array".into()))?;

        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            let id = node
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| GraphError::Invalid("node is missing a string \"id\"".into()))?;
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    fn node_type(&self, node_id: &str) -> String {
        self.graph
            .get("nodes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|n| n.get("id").and_then(Value::as_str) == Some(node_id))
            .and_then(|n| n.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("generic")
            .to_string()
    }
}

#[async_trait]
impl GraphExecutor for SequentialGraphExecutor {
    async fn execute(&self) -> Result<ResultMap, GraphError> {
        use crate::codec::ProgressState;

        let node_ids = self.node_ids()?;
        let mut results = ResultMap::new();

        for node_id in node_ids {
            if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }

            self.callbacks.on_progress(ProgressEvent {
                node_id: node_id.clone(),
                state: ProgressState::Start,
                progress: Some(0),
                text: None,
                meta: None,
            });

            tokio::time::sleep(std::time::Duration::from_millis(10)).await;

            let node_type = self.node_type(&node_id);
            let mut output = NodeOutput::new();
            output.insert("value".to_string(), Value::String(format!("{node_type}:done")));

            self.callbacks.on_progress(ProgressEvent {
                node_id: node_id.clone(),
                state: ProgressState::Done,
                progress: Some(100),
                text: None,
                meta: None,
            });

            if self.node_registry.is_io_category(&node_type) {
                self.callbacks.on_result(&node_id, output.clone());
            }
            results.insert(node_id, output);
        }

        Ok(results)
    }

    fn force_stop(&self, _reason: &str) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

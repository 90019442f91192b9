//! Credential Gate (spec §4.2) plus the two external collaborator
//! contracts it depends on: `NodeRegistry` and `CredentialStore`.
//!
//! Runtime-mutable singletons become explicit dependency injection
//! (design note): both collaborators are trait objects passed in by
//! the caller, never looked up from a process-global.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Looks up the credential keys a node type requires and whether its
/// output is IO-category (streamed immediately rather than batched).
/// The real node registry is out of scope for this crate.
pub trait NodeRegistry: Send + Sync {
    fn required_credential_keys(&self, node_type: &str) -> Vec<String>;
    fn is_io_category(&self, node_type: &str) -> bool;
}

/// Read-only credential lookup. The real credential store is out of
/// scope for this crate; see spec §6.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// Reference `NodeRegistry`: an in-memory table of node type ->
/// (required keys, io-category). `"io"` is pre-registered as an
/// io-category type with no required keys, for convenience in tests
/// and standalone runs.
pub struct InMemoryNodeRegistry {
    entries: HashMap<String, (Vec<String>, bool)>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert("io".to_string(), (Vec::new(), true));
        Self { entries }
    }

    pub fn register(&mut self, node_type: impl Into<String>, required_keys: Vec<String>, io_category: bool) {
        self.entries.insert(node_type.into(), (required_keys, io_category));
    }
}

impl Default for InMemoryNodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry for InMemoryNodeRegistry {
    fn required_credential_keys(&self, node_type: &str) -> Vec<String> {
        self.entries
            .get(node_type)
            .map(|(keys, _)| keys.clone())
            .unwrap_or_default()
    }

    fn is_io_category(&self, node_type: &str) -> bool {
        self.entries.get(node_type).map(|(_, io)| *io).unwrap_or(false)
    }
}

/// Reference `CredentialStore`: backed by process environment
/// variables. Production deployments supply their own.
#[derive(Default)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    pub fn new() -> Self {
        Self
    }
}

impl CredentialStore for EnvCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Walks `graph_data.nodes`, looks up each node's type in the node
/// registry, and unions the declared required credential keys.
pub fn required_keys(graph: &Value, node_registry: &dyn NodeRegistry) -> HashSet<String> {
    let mut keys = HashSet::new();
    let Some(nodes) = graph.get("nodes").and_then(Value::as_array) else {
        return keys;
    };
    for node in nodes {
        let Some(node_type) = node.get("type").and_then(Value::as_str) else {
            continue;
        };
        keys.extend(node_registry.required_credential_keys(node_type));
    }
    keys
}

/// Filters `required` down to the keys the store does not have.
pub fn missing(required: &HashSet<String>, store: &dyn CredentialStore) -> Vec<String> {
    let mut missing: Vec<String> = required.iter().filter(|k| !store.has(k)).cloned().collect();
    missing.sort();
    missing
}

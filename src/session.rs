//! Connection Registry (spec §4.3): maps session identifiers to live
//! connections and their active job, and handles reconnect
//! replacement.
//!
//! Built on a `ConnectionPool`-style shape (DashMap-backed, activity
//! bookkeeping, `stats()`) generalized from a flat client table to a
//! session/connection/job triple, with atomic-replace-on-reconnect
//! semantics: a new connection for an existing session closes the old
//! one and rebinds any active job's output under a single lock.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::codec::OutboundFrame;
use crate::queue::Job;

/// A bidirectional frame channel bound to one session at a time.
///
/// Send discipline (spec §4.5): `send_critical` is awaited and a
/// failure is logged, never propagated as a panic; `send_best_effort`
/// never blocks the caller — it drops the frame if the underlying
/// buffer is full.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send_critical(&self, frame: OutboundFrame);
    fn send_best_effort(&self, frame: OutboundFrame);
    fn is_closed(&self) -> bool;
    /// Close the connection. Idempotent.
    fn close(&self, reason: &str);
}

struct SessionEntry {
    connection: RwLock<Option<Arc<dyn Connection>>>,
    job: RwLock<Option<Arc<Job>>>,
}

impl SessionEntry {
    fn empty() -> Self {
        Self {
            connection: RwLock::new(None),
            job: RwLock::new(None),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub total_established: u64,
}

/// Session/connection/job registry. All mutation of a single session's
/// bindings is serialized through that session's entry locks; the
/// DashMap shard locks serialize creation/removal of entries
/// themselves.
pub struct ConnectionRegistry {
    sessions: DashMap<Uuid, Arc<SessionEntry>>,
    total_established: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            total_established: AtomicU64::new(0),
        }
    }

    /// Establish or resume a session for a freshly-connected socket.
    /// Reuses `requested_session_id` if set and known; otherwise mints
    /// a fresh UUID. Registers the connection and emits `session{...}`
    /// to it before returning.
    pub async fn establish(&self, connection: Arc<dyn Connection>, requested_session_id: Option<Uuid>) -> Uuid {
        let session_id = match requested_session_id {
            Some(id) if self.sessions.contains_key(&id) => id,
            _ => Uuid::new_v4(),
        };

        self.register(session_id, connection.clone()).await;
        self.total_established.fetch_add(1, Ordering::Relaxed);
        connection
            .send_critical(crate::codec::build_session(session_id))
            .await;
        session_id
    }

    /// Bind `connection` to `session_id`. If another connection is
    /// already bound, it is closed with reason "session replaced"
    /// before the new one is bound. If an active job exists, its
    /// connection reference is rebound so output streams to the new
    /// socket.
    pub async fn register(&self, session_id: Uuid, connection: Arc<dyn Connection>) {
        let entry = self
            .sessions
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionEntry::empty()))
            .clone();

        let previous = {
            let mut slot = entry.connection.write();
            slot.replace(connection.clone())
        };
        if let Some(previous) = previous {
            previous.close("session replaced");
        }

        if let Some(job) = entry.job.read().clone() {
            job.rebind_connection(connection);
        }
    }

    /// Remove the binding only if the currently bound connection is
    /// the one given (race-safe against a newer `register`).
    pub fn unregister(&self, session_id: Uuid, connection: &Arc<dyn Connection>) {
        if let Some(entry) = self.sessions.get(&session_id) {
            let mut slot = entry.connection.write();
            let bound_to_us = slot.as_ref().map(|c| Arc::ptr_eq(c, connection)).unwrap_or(false);
            if bound_to_us {
                *slot = None;
            }
        }
    }

    pub fn get_connection(&self, session_id: Uuid) -> Option<Arc<dyn Connection>> {
        self.sessions.get(&session_id)?.connection.read().clone()
    }

    pub fn set_job(&self, session_id: Uuid, job: Option<Arc<Job>>) {
        if let Some(entry) = self.sessions.get(&session_id) {
            *entry.job.write() = job;
        }
    }

    pub fn get_job(&self, session_id: Uuid) -> Option<Arc<Job>> {
        self.sessions.get(&session_id)?.job.read().clone()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_sessions: self.sessions.len(),
            total_established: self.total_established.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

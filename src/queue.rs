//! Execution Queue: a bounded-concurrency scheduler. Any number of
//! jobs may be pending; exactly one may run.
//!
//! Built on the same atomics-plus-lock shape used for connection
//! bookkeeping, generalized to a FIFO/single-flight job scheduler. All
//! `pending`/`running` mutation goes through one `parking_lot::Mutex`;
//! `tokio::sync::Notify` wakes the single worker blocked in `next()`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::codec::{build_queue_position, StatusState};
use crate::session::Connection;
use crate::signal::OneshotSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Cancelled,
    Done,
}

/// One graph execution. See spec §3 for the state machine invariant:
/// PENDING -> RUNNING -> DONE, PENDING -> CANCELLED -> DONE,
/// RUNNING -> CANCELLED -> DONE. No other transition is legal.
pub struct Job {
    pub id: u64,
    pub graph: Value,
    connection: parking_lot::RwLock<Arc<dyn Connection>>,
    state: Mutex<JobState>,
    pub cancel_signal: OneshotSignal,
    pub done_signal: OneshotSignal,
    /// Fired the moment the job leaves PENDING (for any reason), so
    /// the position ticker can wake early instead of waiting out its
    /// full interval.
    left_pending: OneshotSignal,
    /// Fired once the position ticker has sent its last `queue_position`
    /// frame and exited. The worker awaits this before sending
    /// `status{running}`, so the two independently-scheduled tasks
    /// cannot race onto the wire out of order (spec §8: queue_position
    /// ends at 0 *before* `status{running}`).
    ticker_stopped: OneshotSignal,
}

impl Job {
    fn new(id: u64, graph: Value, connection: Arc<dyn Connection>) -> Self {
        Self {
            id,
            graph,
            connection: parking_lot::RwLock::new(connection),
            state: Mutex::new(JobState::Pending),
            cancel_signal: OneshotSignal::new(),
            done_signal: OneshotSignal::new(),
            left_pending: OneshotSignal::new(),
            ticker_stopped: OneshotSignal::new(),
        }
    }

    /// Resolves once the position ticker has sent its final
    /// `queue_position` update and stopped. The worker awaits this
    /// before emitting `status{running}` for the job.
    pub async fn ticker_done(&self) {
        self.ticker_stopped.wait().await;
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.connection.read().clone()
    }

    /// Rebind the job's output connection on reconnect (spec §4.3).
    pub fn rebind_connection(&self, connection: Arc<dyn Connection>) {
        *self.connection.write() = connection;
    }

    fn transition(&self, to: JobState) -> bool {
        let mut state = self.state.lock();
        let legal = matches!(
            (*state, to),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Cancelled)
                | (JobState::Running, JobState::Done)
                | (JobState::Cancelled, JobState::Done)
        );
        if legal {
            *state = to;
        }
        legal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Fifo,
    SingleFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueBusy {
    #[error("a job is already pending or running (single-flight mode)")]
    Busy,
}

struct Inner {
    pending: VecDeque<Arc<Job>>,
    running: Option<Arc<Job>>,
    next_id: u64,
    shutting_down: bool,
}

/// FIFO (or single-flight) scheduler for one server process.
pub struct ExecutionQueue {
    mode: QueueMode,
    inner: Mutex<Inner>,
    notify: Notify,
    position_interval: Duration,
}

impl ExecutionQueue {
    pub fn new(mode: QueueMode, position_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode,
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                running: None,
                next_id: 1,
                shutting_down: false,
            }),
            notify: Notify::new(),
            position_interval,
        })
    }

    /// Allocates a fresh job id, creates a PENDING job, appends it to
    /// `pending`, wakes the worker, sends the initial `status{queued}`
    /// frame synchronously (guaranteeing it precedes the first
    /// `queue_position` frame on the wire), and spawns the
    /// once-per-second position ticker.
    pub async fn enqueue(self: &Arc<Self>, connection: Arc<dyn Connection>, graph: Value) -> Result<Arc<Job>, QueueBusy> {
        let job = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return Err(QueueBusy::Busy);
            }
            if self.mode == QueueMode::SingleFlight && (!inner.pending.is_empty() || inner.running.is_some()) {
                return Err(QueueBusy::Busy);
            }

            let id = inner.next_id;
            inner.next_id += 1;
            let job = Arc::new(Job::new(id, graph, connection));
            inner.pending.push_back(job.clone());
            job
        };

        self.notify.notify_one();

        job.connection()
            .send_critical(crate::codec::build_status(StatusState::Queued, "queued", job.id))
            .await;

        let queue = self.clone();
        let ticker_job = job.clone();
        tokio::spawn(async move { queue.position_ticker(ticker_job).await });

        Ok(job)
    }

    /// Sends `queue_position` updates until the job leaves PENDING, then
    /// fires `job.ticker_stopped` as its very last act — after that
    /// signal resolves, no more `queue_position` frames for this job
    /// will be sent. The worker awaits it before sending
    /// `status{running}` (spec §8 ordering: position ends at 0 before
    /// `running`).
    async fn position_ticker(self: Arc<Self>, job: Arc<Job>) {
        loop {
            let position = self.position(&job);
            if position < 0 {
                job.ticker_stopped.fire();
                return;
            }
            job.connection()
                .send_critical(build_queue_position(position, job.id))
                .await;
            if position == 0 {
                job.ticker_stopped.fire();
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.position_interval) => {}
                _ = job.left_pending.wait() => {}
            }
            if job.state() != JobState::Pending {
                // One last snapshot so observers see position=0 (or the
                // job's departure) before the ticker stops.
                let position = self.position(&job);
                if position >= 0 {
                    job.connection()
                        .send_critical(build_queue_position(position, job.id))
                        .await;
                }
                job.ticker_stopped.fire();
                return;
            }
        }
    }

    /// Blocks until a PENDING job is available (transitions it to
    /// RUNNING and returns it) or the queue is shutting down (returns
    /// `None`).
    pub async fn next(self: &Arc<Self>) -> Option<Arc<Job>> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(job) = inner.pending.pop_front() {
                    job.transition(JobState::Running);
                    inner.running = Some(job.clone());
                    job.left_pending.fire();
                    return Some(job);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Transitions the job to DONE (idempotent), clears `running` if
    /// it held this job, and resolves `done_signal`.
    pub fn mark_done(&self, job: &Arc<Job>) {
        if job.state() == JobState::Done {
            return;
        }
        let transitioned = job.transition(JobState::Done);
        if !transitioned {
            warn!(job_id = job.id, state = ?job.state(), "mark_done called from an unexpected state");
        }
        let mut inner = self.inner.lock();
        if matches!(&inner.running, Some(running) if running.id == job.id) {
            inner.running = None;
        }
        drop(inner);
        job.left_pending.fire();
        job.done_signal.fire();
        debug!(job_id = job.id, "job marked done");
    }

    /// No-op if the job is already CANCELLED or DONE. Otherwise
    /// transitions to CANCELLED and fires `cancel_signal`; if the job
    /// was still pending, removes it and resolves `done_signal`
    /// immediately. Returns `true` when this call resolved the job
    /// itself (it was pending, so no worker will ever touch it and the
    /// caller is responsible for any client-facing confirmation);
    /// `false` when the job was running and the worker owns the
    /// teardown.
    pub fn cancel(&self, job: &Arc<Job>) -> bool {
        let mut inner = self.inner.lock();
        match job.state() {
            JobState::Cancelled | JobState::Done => return false,
            _ => {}
        }

        job.transition(JobState::Cancelled);
        job.cancel_signal.fire();

        let was_pending = if let Some(pos) = inner.pending.iter().position(|j| j.id == job.id) {
            inner.pending.remove(pos);
            true
        } else {
            false
        };
        drop(inner);

        job.left_pending.fire();
        if was_pending {
            job.transition(JobState::Done);
            job.done_signal.fire();
        }
        was_pending
    }

    /// 0 if running, (index+1) if pending, -1 otherwise.
    pub fn position(&self, job: &Arc<Job>) -> i64 {
        let inner = self.inner.lock();
        if matches!(&inner.running, Some(running) if running.id == job.id) {
            return 0;
        }
        match inner.pending.iter().position(|j| j.id == job.id) {
            Some(idx) => (idx + 1) as i64,
            None => -1,
        }
    }

    /// Marks the queue terminal, cancels all pending jobs and the
    /// running job, and wakes `next()` so the worker exits.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutting_down = true;

        let pending: Vec<Arc<Job>> = inner.pending.drain(..).collect();
        let running = inner.running.clone();
        drop(inner);

        for job in pending {
            job.transition(JobState::Cancelled);
            job.cancel_signal.fire();
            job.left_pending.fire();
            job.transition(JobState::Done);
            job.done_signal.fire();
        }
        if let Some(job) = running {
            job.transition(JobState::Cancelled);
            job.cancel_signal.fire();
        }

        self.notify.notify_waiters();
    }
}

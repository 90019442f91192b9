//! One-shot, multi-observer event used for `cancel_signal` and
//! `done_signal` (spec design note: "fire once, observe any number of
//! times, idempotent").

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct OneshotSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl OneshotSignal {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Fire the signal. Idempotent: subsequent calls are no-ops.
    pub fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolve immediately if already fired; otherwise suspend until
    /// `fire()` is called. Safe to call from any number of observers,
    /// any number of times, even after the signal has fired.
    pub async fn wait(&self) {
        if self.is_fired() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}

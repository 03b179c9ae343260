//! Dispatch Statistics Module
//!
//! Tracks hook outcomes so sandbox timeouts and failures are observable at
//! the dispatch layer without reaching the triggering caller.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Dispatch Stats ==
/// Live hook outcome counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    /// Hook runs started
    pub dispatched: u64,
    /// Hook runs that returned Ok
    pub succeeded: u64,
    /// Hook runs that returned an error or panicked
    pub failed: u64,
    /// Hook runs that overran their deadline
    pub timed_out: u64,
}

impl DispatchSnapshot {
    /// Runs that have reached an outcome.
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.timed_out
    }
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

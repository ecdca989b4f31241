//! Dispatch counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Dispatch statistics.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub fed: AtomicU64,
    pub committed: AtomicU64,
    pub rolled_back: AtomicU64,
    pub discarded: AtomicU64,
    pub worker_failures: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub fed: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub discarded: u64,
    pub worker_failures: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fed: self.fed.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            worker_failures: self.worker_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

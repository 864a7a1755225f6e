//! Lease activity counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one lease manager.
#[derive(Debug, Default)]
pub struct LeaseMetrics {
    /// Successful acquisitions (including idempotent re-acquisitions)
    pub acquisitions: AtomicU64,

    /// Acquisitions refused because another holder was active
    pub denials: AtomicU64,

    /// Heartbeat refreshes written
    pub heartbeats: AtomicU64,

    /// Heartbeat writes that failed
    pub heartbeat_failures: AtomicU64,

    /// Storage errors swallowed by `is_held`, `acquire` or `release`
    pub storage_errors: AtomicU64,
}

impl LeaseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> LeaseMetricsSnapshot {
        LeaseMetricsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`LeaseMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseMetricsSnapshot {
    pub acquisitions: u64,
    pub denials: u64,
    pub heartbeats: u64,
    pub heartbeat_failures: u64,
    pub storage_errors: u64,
}

//! [`LeaseManager`] implementation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use parley_core::{
    Clock, HolderId, LeaseConfig, LeaseRecord, ParleyError, ParleyResult, StorageError,
    SystemClock,
};
use parley_storage::LeaseStore;

use crate::heartbeat::{Heartbeat, HeartbeatHandle};
use crate::metrics::{LeaseMetrics, LeaseMetricsSnapshot};

/// What the lease slot looks like from this manager's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseObservation {
    /// No record.
    Vacant,
    /// The record names this manager, regardless of its age.
    OwnedBySelf(LeaseRecord),
    /// Another holder's record, still within the timeout.
    HeldByOther {
        record: LeaseRecord,
        remaining: Duration,
    },
    /// Another holder's record, older than the timeout.
    Stale(LeaseRecord),
}

/// Decision reached before a mutation.
enum Claim {
    Blocked,
    /// The slot can be claimed by swapping out `expected`.
    Available { expected: Option<LeaseRecord> },
}

/// Exclusive lease over one slot of a shared [`LeaseStore`].
///
/// Every mutation is a compare-and-swap against the record just read, with
/// the holder id as the concurrency token. With a store whose swap is atomic
/// two processes can never both acquire; with a plain store they can if both
/// read "vacant" before either writes.
///
/// Dropping the manager aborts the heartbeat without touching the record, so
/// the lease goes stale after the timeout. Call [`release`](Self::release)
/// for a prompt handover.
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    holder_id: HolderId,
    config: LeaseConfig,
    metrics: Arc<LeaseMetrics>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl LeaseManager {
    /// Create a manager with a fresh holder id and the system clock.
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaseConfig) -> Self {
        if !store.supports_atomic_swap() {
            tracing::debug!(
                slot = %config.slot,
                "Lease store has no atomic swap; simultaneous acquisition can race"
            );
        }
        Self {
            store,
            clock: Arc::new(SystemClock),
            holder_id: HolderId::now_v7(),
            config,
            metrics: Arc::new(LeaseMetrics::new()),
            heartbeat: Mutex::new(None),
        }
    }

    /// Replace the clock used for timestamps and staleness.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn holder_id(&self) -> HolderId {
        self.holder_id
    }

    pub fn slot(&self) -> &str {
        &self.config.slot
    }

    pub fn metrics(&self) -> LeaseMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether this manager's heartbeat task is running.
    pub fn heartbeat_active(&self) -> bool {
        self.heartbeat_slot()
            .as_ref()
            .map(HeartbeatHandle::is_running)
            .unwrap_or(false)
    }

    /// Classify the current record. Read-only.
    pub async fn inspect(&self) -> ParleyResult<LeaseObservation> {
        let Some(record) = self.store.read(&self.config.slot).await? else {
            return Ok(LeaseObservation::Vacant);
        };
        if record.is_held_by(self.holder_id) {
            return Ok(LeaseObservation::OwnedBySelf(record));
        }
        let now = self.clock.now();
        Ok(match record.remaining(now, self.config.timeout()) {
            Some(remaining) => LeaseObservation::HeldByOther { record, remaining },
            None => LeaseObservation::Stale(record),
        })
    }

    /// Whether another live holder owns the lease.
    ///
    /// `false` if the slot is empty, owned by this manager, or stale (the
    /// stale record is deleted). Storage errors are logged and read as
    /// `false`.
    pub async fn is_held(&self) -> bool {
        match self.assess().await {
            Ok(Claim::Blocked) => true,
            Ok(Claim::Available { .. }) => false,
            Err(e) => {
                self.storage_error(&e, "Lease check failed, treating as not held");
                false
            }
        }
    }

    /// Try to become the holder. Returns whether this manager holds the lease
    /// afterwards.
    ///
    /// Acquiring while already holding succeeds and refreshes the timestamp.
    /// On success the heartbeat is running. A `false` return means another
    /// process is active (or storage failed) and nothing was written.
    pub async fn acquire(&self) -> bool {
        let expected = match self.assess().await {
            Ok(Claim::Available { expected }) => expected,
            Ok(Claim::Blocked) => {
                LeaseMetrics::incr(&self.metrics.denials);
                tracing::info!(
                    holder_id = %self.holder_id,
                    slot = %self.config.slot,
                    "Lease held by another process"
                );
                return false;
            }
            Err(e) => {
                self.storage_error(&e, "Lease check failed, not acquiring");
                return false;
            }
        };

        let record = LeaseRecord::new(self.holder_id, self.clock.now());
        match self
            .store
            .compare_and_swap(&self.config.slot, expected, Some(record))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                if !self.still_ours().await {
                    LeaseMetrics::incr(&self.metrics.denials);
                    tracing::info!(
                        holder_id = %self.holder_id,
                        slot = %self.config.slot,
                        "Lease claimed concurrently by another process"
                    );
                    return false;
                }
                tracing::debug!(
                    holder_id = %self.holder_id,
                    "Lease refreshed by own heartbeat during acquire"
                );
            }
            Err(e) => {
                self.storage_error(&e, "Lease write failed, not acquiring");
                return false;
            }
        }

        self.ensure_heartbeat();
        LeaseMetrics::incr(&self.metrics.acquisitions);
        tracing::info!(
            holder_id = %self.holder_id,
            slot = %self.config.slot,
            timeout_ms = self.config.timeout_ms,
            "Lease acquired"
        );
        true
    }

    /// Stop the heartbeat and delete the record if it still names this
    /// manager. Never fails.
    pub async fn release(&self) {
        let handle = self.heartbeat_slot().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }

        let slot = &self.config.slot;
        let current = match self.store.read(slot).await {
            Ok(current) => current,
            Err(e) => {
                self.storage_error(&e, "Lease read failed during release");
                return;
            }
        };
        match current {
            Some(record) if record.is_held_by(self.holder_id) => {
                match self.store.compare_and_swap(slot, Some(record), None).await {
                    Ok(true) => {
                        tracing::info!(holder_id = %self.holder_id, slot = %slot, "Lease released");
                    }
                    Ok(false) => {
                        tracing::debug!(
                            holder_id = %self.holder_id,
                            "Lease record changed during release, leaving it"
                        );
                    }
                    Err(e) => self.storage_error(&e, "Lease delete failed during release"),
                }
            }
            Some(record) => {
                tracing::debug!(
                    holder_id = %self.holder_id,
                    current_holder = %record.holder_id,
                    "Lease owned by another holder, nothing to release"
                );
            }
            None => {
                tracing::debug!(holder_id = %self.holder_id, "No lease record to release");
            }
        }
    }

    async fn assess(&self) -> ParleyResult<Claim> {
        match self.inspect().await {
            Ok(LeaseObservation::Vacant) => Ok(Claim::Available { expected: None }),
            Ok(LeaseObservation::OwnedBySelf(record)) => Ok(Claim::Available {
                expected: Some(record),
            }),
            Ok(LeaseObservation::HeldByOther { .. }) => Ok(Claim::Blocked),
            Ok(LeaseObservation::Stale(record)) => {
                let cleared = self
                    .store
                    .compare_and_swap(&self.config.slot, Some(record), None)
                    .await?;
                if cleared {
                    tracing::info!(
                        stale_holder = %record.holder_id,
                        slot = %self.config.slot,
                        "Removed stale lease record"
                    );
                    Ok(Claim::Available { expected: None })
                } else {
                    // Someone rewrote the slot after we read it.
                    Ok(Claim::Blocked)
                }
            }
            Err(ParleyError::Storage(StorageError::Corrupted { reason })) => {
                if self.store.remove_if_corrupted(&self.config.slot).await? {
                    tracing::warn!(
                        slot = %self.config.slot,
                        reason = %reason,
                        "Removed unreadable lease record"
                    );
                    Ok(Claim::Available { expected: None })
                } else {
                    // Repaired by another process after we read it.
                    tracing::info!(
                        slot = %self.config.slot,
                        "Unreadable lease record was replaced concurrently"
                    );
                    Ok(Claim::Blocked)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the slot names this manager right now. Read errors count as
    /// no.
    async fn still_ours(&self) -> bool {
        match self.store.read(&self.config.slot).await {
            Ok(current) => current.is_some_and(|record| record.is_held_by(self.holder_id)),
            Err(_) => false,
        }
    }

    fn ensure_heartbeat(&self) {
        let mut slot = self.heartbeat_slot();
        if slot.as_ref().is_some_and(HeartbeatHandle::is_running) {
            return;
        }
        *slot = Some(HeartbeatHandle::spawn(Heartbeat {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            metrics: Arc::clone(&self.metrics),
            holder_id: self.holder_id,
            slot: self.config.slot.clone(),
            period: self.config.heartbeat_interval(),
        }));
    }

    fn heartbeat_slot(&self) -> MutexGuard<'_, Option<HeartbeatHandle>> {
        match self.heartbeat.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn storage_error(&self, error: &ParleyError, message: &'static str) {
        LeaseMetrics::incr(&self.metrics.storage_errors);
        tracing::warn!(
            error = %error,
            holder_id = %self.holder_id,
            slot = %self.config.slot,
            "{}",
            message
        );
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("holder_id", &self.holder_id)
            .field("slot", &self.config.slot)
            .field("store", &self.store)
            .field("heartbeat_active", &self.heartbeat_active())
            .finish()
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat_slot().take() {
            handle.abort();
        }
    }
}

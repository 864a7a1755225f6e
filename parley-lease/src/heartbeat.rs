//! Heartbeat background task.
//!
//! While a lease is held the task rewrites the record's timestamp every
//! heartbeat interval. Each refresh is a compare-and-swap against the record
//! just read, and only happens if that record still names this holder. The
//! task ends on shutdown, or by itself once the lease has been taken over.

use std::sync::Arc;
use std::time::Duration;

use parley_core::{Clock, HolderId, LeaseRecord, ParleyResult};
use parley_storage::LeaseStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::metrics::LeaseMetrics;

/// Everything the task needs, detached from the manager.
pub(crate) struct Heartbeat {
    pub store: Arc<dyn LeaseStore>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<LeaseMetrics>,
    pub holder_id: HolderId,
    pub slot: String,
    pub period: Duration,
}

/// Owner of a running heartbeat task.
pub(crate) struct HeartbeatHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn spawn(heartbeat: Heartbeat) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(heartbeat.run(shutdown_rx));
        Self { shutdown_tx, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal shutdown and wait for the task to exit, so no refresh can land
    /// after this returns.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "Lease heartbeat task panicked");
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

enum Beat {
    Refreshed,
    /// The slot is empty or names another holder.
    Lost(Option<LeaseRecord>),
    /// The record changed between read and swap; retry next tick.
    Raced,
}

impl Heartbeat {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(
            holder_id = %self.holder_id,
            slot = %self.slot,
            period_ms = self.period.as_millis() as u64,
            "Lease heartbeat started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!(holder_id = %self.holder_id, "Lease heartbeat stopped");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    match self.beat().await {
                        Ok(Beat::Refreshed) => {
                            LeaseMetrics::incr(&self.metrics.heartbeats);
                            tracing::trace!(holder_id = %self.holder_id, "Lease refreshed");
                        }
                        Ok(Beat::Raced) => {
                            tracing::debug!(
                                holder_id = %self.holder_id,
                                "Lease record changed during refresh, retrying next tick"
                            );
                        }
                        Ok(Beat::Lost(current)) => {
                            tracing::warn!(
                                holder_id = %self.holder_id,
                                slot = %self.slot,
                                current_holder = ?current.map(|r| r.holder_id),
                                "Lease lost, stopping heartbeat"
                            );
                            break;
                        }
                        Err(e) => {
                            // A missed refresh only risks the lease going stale.
                            LeaseMetrics::incr(&self.metrics.heartbeat_failures);
                            tracing::warn!(
                                error = %e,
                                holder_id = %self.holder_id,
                                "Lease heartbeat write failed"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn beat(&self) -> ParleyResult<Beat> {
        let current = match self.store.read(&self.slot).await? {
            Some(record) if record.is_held_by(self.holder_id) => record,
            other => return Ok(Beat::Lost(other)),
        };
        let refreshed = current.refreshed(self.clock.now());
        if self
            .store
            .compare_and_swap(&self.slot, Some(current), Some(refreshed))
            .await?
        {
            Ok(Beat::Refreshed)
        } else {
            Ok(Beat::Raced)
        }
    }
}

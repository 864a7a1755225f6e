//! Persisted lease record.
//!
//! The record is the only piece of state shared across processes. It lives in
//! a single named slot of a lease store and is serialized as
//! `{"holderId": "...", "timestamp": <epoch millis>}`.
//!
//! ```text
//! (vacant) ── acquire ──→ held ── release ──→ (vacant)
//!                          │  ↺ heartbeat
//!                          └── timeout elapses ──→ stale ── acquire (other) ──→ held
//! ```

use crate::{HolderId, ParleyResult, StorageError, Timestamp};
use chrono::SubsecRound;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A claim of exclusive ownership written by the holding process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub holder_id: HolderId,
    /// Last time the holder wrote the record (acquire or heartbeat).
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: Timestamp,
}

impl LeaseRecord {
    /// The timestamp is truncated to milliseconds, the precision it is
    /// persisted with, so a record compares equal to its stored copy.
    pub fn new(holder_id: HolderId, timestamp: Timestamp) -> Self {
        Self {
            holder_id,
            timestamp: timestamp.trunc_subsecs(3),
        }
    }

    /// Time since the record was last written. Zero if the record is from the
    /// future (clock skew between processes).
    pub fn age(&self, now: Timestamp) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    /// A record is stale once its age exceeds the timeout.
    pub fn is_stale(&self, now: Timestamp, timeout: Duration) -> bool {
        self.age(now) > timeout
    }

    /// Remaining validity, or `None` once stale.
    pub fn remaining(&self, now: Timestamp, timeout: Duration) -> Option<Duration> {
        timeout.checked_sub(self.age(now))
    }

    pub fn is_held_by(&self, holder_id: HolderId) -> bool {
        self.holder_id == holder_id
    }

    /// Same holder, new timestamp.
    pub fn refreshed(&self, now: Timestamp) -> Self {
        Self::new(self.holder_id, now)
    }

    pub fn to_bytes(&self) -> ParleyResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            StorageError::Serialization {
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> ParleyResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            StorageError::Corrupted {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_record_valid_at_exact_timeout() {
        let now = Utc::now();
        let record = LeaseRecord::new(HolderId::now_v7(), now - chrono::Duration::seconds(5));
        assert!(!record.is_stale(now, TIMEOUT));
        assert_eq!(record.remaining(now, TIMEOUT), Some(Duration::ZERO));
    }

    #[test]
    fn test_record_stale_past_timeout() {
        let now = Utc::now();
        let record =
            LeaseRecord::new(HolderId::now_v7(), now - chrono::Duration::milliseconds(5001));
        assert!(record.is_stale(now, TIMEOUT));
        assert_eq!(record.remaining(now, TIMEOUT), None);
    }

    #[test]
    fn test_future_timestamp_has_zero_age() {
        let now = Utc::now();
        let record = LeaseRecord::new(HolderId::now_v7(), now + chrono::Duration::seconds(30));
        assert_eq!(record.age(now), Duration::ZERO);
        assert!(!record.is_stale(now, TIMEOUT));
    }

    #[test]
    fn test_refresh_keeps_holder() {
        let holder = HolderId::now_v7();
        let then = Utc::now() - chrono::Duration::seconds(3);
        let now = Utc::now();
        let refreshed = LeaseRecord::new(holder, then).refreshed(now);
        assert!(refreshed.is_held_by(holder));
        assert_eq!(refreshed.timestamp, now.trunc_subsecs(3));
    }

    #[test]
    fn test_wire_format() {
        let record = LeaseRecord::new(
            HolderId::now_v7(),
            chrono::DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        );
        let value: serde_json::Value = serde_json::from_slice(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(value["timestamp"], 1_700_000_000_123i64);
        assert_eq!(value["holderId"], record.holder_id.to_string());
    }

    #[test]
    fn test_stored_copy_compares_equal() {
        let record = LeaseRecord::new(HolderId::now_v7(), Utc::now());
        assert_eq!(LeaseRecord::from_bytes(&record.to_bytes().unwrap()).unwrap(), record);
    }

    #[test]
    fn test_corrupted_bytes_are_storage_errors() {
        let err = LeaseRecord::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(
            err,
            crate::ParleyError::Storage(StorageError::Corrupted { .. })
        ));
    }
}

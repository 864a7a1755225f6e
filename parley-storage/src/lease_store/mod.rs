//! Shared lease stores.
//!
//! A lease store holds named slots, each containing at most one
//! [`LeaseRecord`]. Every cooperating process sees the same slots. Absence of
//! a record means the slot is unlocked.

mod lmdb;
mod memory;

pub use lmdb::{LmdbLeaseStore, LmdbLeaseStoreError};
pub use memory::InMemoryLeaseStore;

use async_trait::async_trait;
use parley_core::{LeaseRecord, ParleyError, ParleyResult, StorageError};

/// Persistence port for lease records.
#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    /// Current record in `slot`, if any.
    async fn read(&self, slot: &str) -> ParleyResult<Option<LeaseRecord>>;

    /// Unconditionally overwrite `slot`.
    async fn write(&self, slot: &str, record: LeaseRecord) -> ParleyResult<()>;

    /// Unconditionally clear `slot`. Clearing an empty slot is not an error.
    async fn remove(&self, slot: &str) -> ParleyResult<()>;

    /// Replace the contents of `slot` with `new` (`None` clears it) only if
    /// the slot currently holds exactly `expected`. Returns whether the swap
    /// happened.
    ///
    /// The default implementation is read-verify-write: another process can
    /// write between the read and the write. Backends that can do better
    /// override it and report so through [`supports_atomic_swap`].
    ///
    /// [`supports_atomic_swap`]: LeaseStore::supports_atomic_swap
    async fn compare_and_swap(
        &self,
        slot: &str,
        expected: Option<LeaseRecord>,
        new: Option<LeaseRecord>,
    ) -> ParleyResult<bool> {
        if self.read(slot).await? != expected {
            return Ok(false);
        }
        match new {
            Some(record) => self.write(slot, record).await?,
            None => self.remove(slot).await?,
        }
        Ok(true)
    }

    /// Clear `slot` only if it still holds bytes that do not parse as a
    /// record. Returns whether anything was removed; `false` means the slot
    /// is now empty or holds a readable record.
    ///
    /// Same atomicity caveat as [`compare_and_swap`](LeaseStore::compare_and_swap).
    async fn remove_if_corrupted(&self, slot: &str) -> ParleyResult<bool> {
        match self.read(slot).await {
            Ok(_) => Ok(false),
            Err(ParleyError::Storage(StorageError::Corrupted { .. })) => {
                self.remove(slot).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `compare_and_swap` and `remove_if_corrupted` are atomic with
    /// respect to other processes.
    fn supports_atomic_swap(&self) -> bool {
        false
    }
}

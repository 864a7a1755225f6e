//! LMDB-backed lease store shared by OS processes.
//!
//! Uses the heed crate. Every process opens the same environment directory;
//! LMDB serializes write transactions across processes, so a
//! compare-and-swap performed inside one write transaction is atomic.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use parley_core::{LeaseConfig, LeaseRecord, ParleyError, ParleyResult, StorageError};

use super::LeaseStore;

const LEASE_DB_NAME: &str = "leases";

/// Error type for LMDB lease store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbLeaseStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the lease database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbLeaseStoreError> for ParleyError {
    fn from(e: LmdbLeaseStoreError) -> Self {
        match e {
            LmdbLeaseStoreError::Transaction(reason) => {
                ParleyError::Storage(StorageError::TransactionFailed { reason })
            }
            other => ParleyError::Storage(StorageError::Unavailable {
                reason: other.to_string(),
            }),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbLeaseStoreError {
    LmdbLeaseStoreError::Transaction(e.to_string())
}

/// Lease store persisted in an LMDB environment.
///
/// Cloning is cheap and clones share the environment. Open a given directory
/// once per process and hand out clones.
#[derive(Clone)]
pub struct LmdbLeaseStore {
    env: Env,
    db: Database<Str, Bytes>,
    path: PathBuf,
}

impl LmdbLeaseStore {
    /// Open (creating if needed) the lease environment at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - The lease database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbLeaseStoreError> {
        let map_size = max_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            LmdbLeaseStoreError::EnvOpen(format!("map size of {} MB overflows", max_size_mb))
        })?;
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is only ever opened through this type, and
        // the lease database is never mutated outside heed transactions.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbLeaseStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(LEASE_DB_NAME))
            .map_err(|e| LmdbLeaseStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            db,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open the store described by the `lease` config section.
    pub fn from_config(config: &LeaseConfig) -> Result<Self, LmdbLeaseStoreError> {
        Self::open(&config.store_path, config.store_max_size_mb)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_in(&self, txn: &RoTxn<'_>, slot: &str) -> ParleyResult<Option<LeaseRecord>> {
        self.db
            .get(txn, slot)
            .map_err(txn_err)?
            .map(LeaseRecord::from_bytes)
            .transpose()
    }
}

impl fmt::Debug for LmdbLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmdbLeaseStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LeaseStore for LmdbLeaseStore {
    async fn read(&self, slot: &str) -> ParleyResult<Option<LeaseRecord>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.read_in(&rtxn, slot)
    }

    async fn write(&self, slot: &str, record: LeaseRecord) -> ParleyResult<()> {
        let bytes = record.to_bytes()?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db
            .put(&mut wtxn, slot, bytes.as_slice())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn remove(&self, slot: &str) -> ParleyResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db.delete(&mut wtxn, slot).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        slot: &str,
        expected: Option<LeaseRecord>,
        new: Option<LeaseRecord>,
    ) -> ParleyResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        if self.read_in(&wtxn, slot)? != expected {
            // Dropping the transaction aborts it.
            return Ok(false);
        }
        match new {
            Some(record) => {
                let bytes = record.to_bytes()?;
                self.db
                    .put(&mut wtxn, slot, bytes.as_slice())
                    .map_err(txn_err)?;
            }
            None => {
                self.db.delete(&mut wtxn, slot).map_err(txn_err)?;
            }
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    async fn remove_if_corrupted(&self, slot: &str) -> ParleyResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let unreadable = self
            .db
            .get(&wtxn, slot)
            .map_err(txn_err)?
            .is_some_and(|bytes| LeaseRecord::from_bytes(bytes).is_err());
        if !unreadable {
            return Ok(false);
        }
        self.db.delete(&mut wtxn, slot).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    fn supports_atomic_swap(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_core::HolderId;
    use tempfile::TempDir;

    const SLOT: &str = "parley.test";

    fn store() -> (TempDir, LmdbLeaseStore) {
        let dir = TempDir::new().unwrap();
        let store = LmdbLeaseStore::open(dir.path(), 1).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let (_dir, store) = store();
        let record = LeaseRecord::new(HolderId::now_v7(), Utc::now());

        assert_eq!(store.read(SLOT).await.unwrap(), None);
        store.write(SLOT, record).await.unwrap();
        assert_eq!(store.read(SLOT).await.unwrap(), Some(record));
        store.remove(SLOT).await.unwrap();
        assert_eq!(store.read(SLOT).await.unwrap(), None);
        // Removing an empty slot is fine.
        store.remove(SLOT).await.unwrap();
    }

    #[tokio::test]
    async fn test_compare_and_swap_is_conditional() {
        let (_dir, store) = store();
        let first = LeaseRecord::new(HolderId::now_v7(), Utc::now());
        let second = LeaseRecord::new(HolderId::now_v7(), Utc::now());

        assert!(store.compare_and_swap(SLOT, None, Some(first)).await.unwrap());
        assert!(!store.compare_and_swap(SLOT, None, Some(second)).await.unwrap());
        assert_eq!(store.read(SLOT).await.unwrap(), Some(first));

        assert!(store.compare_and_swap(SLOT, Some(first), Some(second)).await.unwrap());
        assert!(!store.compare_and_swap(SLOT, Some(first), None).await.unwrap());
        assert!(store.compare_and_swap(SLOT, Some(second), None).await.unwrap());
        assert_eq!(store.read(SLOT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_environment() {
        let (_dir, store) = store();
        let other = store.clone();
        let record = LeaseRecord::new(HolderId::now_v7(), Utc::now());
        store.write(SLOT, record).await.unwrap();
        assert_eq!(other.read(SLOT).await.unwrap(), Some(record));
        assert!(other.supports_atomic_swap());
    }

    #[tokio::test]
    async fn test_slots_are_independent() {
        let (_dir, store) = store();
        let record = LeaseRecord::new(HolderId::now_v7(), Utc::now());
        store.write("a", record).await.unwrap();
        assert_eq!(store.read("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_if_corrupted_checks_inside_txn() {
        let (_dir, store) = store();
        let record = LeaseRecord::new(HolderId::now_v7(), Utc::now());
        store.write(SLOT, record).await.unwrap();
        assert!(!store.remove_if_corrupted(SLOT).await.unwrap());
        assert_eq!(store.read(SLOT).await.unwrap(), Some(record));

        let mut wtxn = store.env.write_txn().unwrap();
        store.db.put(&mut wtxn, SLOT, b"{\"holderId\":").unwrap();
        wtxn.commit().unwrap();
        assert!(store.read(SLOT).await.is_err());

        assert!(store.remove_if_corrupted(SLOT).await.unwrap());
        assert_eq!(store.read(SLOT).await.unwrap(), None);
    }

    #[test]
    fn test_oversized_map_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = LmdbLeaseStore::open(dir.path(), usize::MAX).unwrap_err();
        assert!(matches!(err, LmdbLeaseStoreError::EnvOpen(_)));
    }

    #[test]
    fn test_error_conversion() {
        let err: ParleyError = LmdbLeaseStoreError::Transaction("boom".to_string()).into();
        assert!(matches!(
            err,
            ParleyError::Storage(StorageError::TransactionFailed { .. })
        ));
        let err: ParleyError = LmdbLeaseStoreError::EnvOpen("nope".to_string()).into();
        assert!(matches!(err, ParleyError::Storage(StorageError::Unavailable { .. })));
    }
}

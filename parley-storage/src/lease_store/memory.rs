//! In-process lease store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parley_core::{LeaseRecord, ParleyResult, StorageError};

use super::LeaseStore;

/// Lease store backed by a shared in-memory map.
///
/// Clones share the same slots, so several lease managers built from clones
/// behave like cooperating processes over one persisted store. Records are
/// kept in their serialized form.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseStore {
    slots: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write raw bytes into `slot`, bypassing record serialization.
    pub fn write_raw(&self, slot: &str, bytes: Vec<u8>) -> ParleyResult<()> {
        let mut slots = self.slots.lock().map_err(|_| StorageError::LockPoisoned)?;
        slots.insert(slot.to_string(), bytes);
        Ok(())
    }

    fn decode(slots: &HashMap<String, Vec<u8>>, slot: &str) -> ParleyResult<Option<LeaseRecord>> {
        slots
            .get(slot)
            .map(|bytes| LeaseRecord::from_bytes(bytes))
            .transpose()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn read(&self, slot: &str) -> ParleyResult<Option<LeaseRecord>> {
        let slots = self.slots.lock().map_err(|_| StorageError::LockPoisoned)?;
        Self::decode(&slots, slot)
    }

    async fn write(&self, slot: &str, record: LeaseRecord) -> ParleyResult<()> {
        let bytes = record.to_bytes()?;
        self.write_raw(slot, bytes)
    }

    async fn remove(&self, slot: &str) -> ParleyResult<()> {
        let mut slots = self.slots.lock().map_err(|_| StorageError::LockPoisoned)?;
        slots.remove(slot);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        slot: &str,
        expected: Option<LeaseRecord>,
        new: Option<LeaseRecord>,
    ) -> ParleyResult<bool> {
        let mut slots = self.slots.lock().map_err(|_| StorageError::LockPoisoned)?;
        if Self::decode(&slots, slot)? != expected {
            return Ok(false);
        }
        match new {
            Some(record) => {
                slots.insert(slot.to_string(), record.to_bytes()?);
            }
            None => {
                slots.remove(slot);
            }
        }
        Ok(true)
    }

    async fn remove_if_corrupted(&self, slot: &str) -> ParleyResult<bool> {
        let mut slots = self.slots.lock().map_err(|_| StorageError::LockPoisoned)?;
        let unreadable = slots
            .get(slot)
            .is_some_and(|bytes| LeaseRecord::from_bytes(bytes).is_err());
        if unreadable {
            slots.remove(slot);
        }
        Ok(unreadable)
    }

    fn supports_atomic_swap(&self) -> bool {
        true
    }
}

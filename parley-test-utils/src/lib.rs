//! Parley Test Utilities
//!
//! Shared test infrastructure for the Parley workspace:
//! - A scripted mock lookup backend that records call patterns
//! - A fault-injecting lease store
//! - Proptest generators for identity types
//! - Fixtures for configs, clocks and lease managers
//! - Assertions over cache ordering

// Re-export core types for convenience
pub use parley_core::{
    Address, ChainId, Clock, ConversationId, HolderId, LeaseConfig, LeaseRecord, LookupStatus,
    ManualClock, MessageId, ParleyConfig, ParleyError, ParleyResult, StorageError, Timestamp,
    TxHash,
};
pub use parley_storage::{BoundedCache, InMemoryLeaseStore, LeaseStore};

use async_trait::async_trait;
use parley_lookup::{LookupBackend, Resolvable};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// MOCK LOOKUP BACKEND
// ============================================================================

/// Request understood by [`MockLookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRequest {
    pub key: String,
    pub created_at: Option<Timestamp>,
    /// Locally-known metadata that a lookup must never overwrite.
    pub note: String,
}

impl MockRequest {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            note: format!("local:{}", key),
            key,
            created_at: None,
        }
    }

    pub fn created_at(mut self, at: Timestamp) -> Self {
        self.created_at = Some(at);
        self
    }
}

/// Result produced by [`MockLookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResult {
    pub key: String,
    pub note: String,
    pub status: LookupStatus,
    /// Which lookup call produced this result; `None` if synthesized.
    pub call: Option<usize>,
}

impl Resolvable for MockResult {
    fn status(&self) -> LookupStatus {
        self.status
    }
}

/// One scripted lookup outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Status(LookupStatus),
    Fail(String),
}

#[derive(Debug, Default)]
struct MockLookupState {
    script: Mutex<VecDeque<MockOutcome>>,
    calls: AtomicUsize,
    calls_per_key: Mutex<HashMap<String, usize>>,
    in_flight_per_key: Mutex<HashMap<String, usize>>,
    max_in_flight_per_key: AtomicUsize,
}

/// Scripted lookup backend.
///
/// Outcomes are consumed from a shared script in call order; once the script
/// is empty every lookup confirms. Each lookup takes `delay` (tokio time).
/// Clones share the script and the counters, so a clone kept by the test can
/// observe the one moved into a coalescer.
#[derive(Debug, Clone)]
pub struct MockLookup {
    state: Arc<MockLookupState>,
    delay: Duration,
}

impl MockLookup {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(outcomes: Vec<MockOutcome>) -> Self {
        let state = MockLookupState {
            script: Mutex::new(outcomes.into()),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
            delay: Duration::from_millis(50),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Append outcomes to the script.
    pub fn push(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        if let Ok(mut script) = self.state.script.lock() {
            script.extend(outcomes);
        }
    }

    /// Total lookups issued.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.state
            .calls_per_key
            .lock()
            .map(|m| m.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Highest number of simultaneous lookups observed for any one key.
    pub fn max_in_flight_per_key(&self) -> usize {
        self.state.max_in_flight_per_key.load(Ordering::SeqCst)
    }

    fn enter(&self, key: &str) -> usize {
        let call = self.state.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut per_key) = self.state.calls_per_key.lock() {
            *per_key.entry(key.to_string()).or_default() += 1;
        }
        if let Ok(mut in_flight) = self.state.in_flight_per_key.lock() {
            let n = in_flight.entry(key.to_string()).or_default();
            *n += 1;
            self.state.max_in_flight_per_key.fetch_max(*n, Ordering::SeqCst);
        }
        call
    }

    fn exit(&self, key: &str) {
        if let Ok(mut in_flight) = self.state.in_flight_per_key.lock() {
            if let Some(n) = in_flight.get_mut(key) {
                *n = n.saturating_sub(1);
            }
        }
    }
}

impl Default for MockLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LookupBackend for MockLookup {
    type Request = MockRequest;
    type Key = String;
    type Fetched = (LookupStatus, usize);
    type Output = MockResult;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn key(&self, request: &MockRequest) -> String {
        request.key.clone()
    }

    fn created_at(&self, request: &MockRequest) -> Option<Timestamp> {
        request.created_at
    }

    async fn lookup(&self, request: &MockRequest) -> ParleyResult<(LookupStatus, usize)> {
        let call = self.enter(&request.key);
        tokio::time::sleep(self.delay).await;
        self.exit(&request.key);

        let outcome = self
            .state
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front());
        match outcome.unwrap_or(MockOutcome::Status(LookupStatus::Confirmed)) {
            MockOutcome::Status(status) => Ok((status, call)),
            MockOutcome::Fail(reason) => Err(parley_core::LookupError::RequestFailed {
                backend: "mock".to_string(),
                status: 503,
                message: reason,
            }
            .into()),
        }
    }

    fn merge(&self, request: &MockRequest, (status, call): (LookupStatus, usize)) -> MockResult {
        MockResult {
            key: request.key.clone(),
            note: request.note.clone(),
            status,
            call: Some(call),
        }
    }

    fn synthesize(&self, request: &MockRequest, status: LookupStatus) -> MockResult {
        MockResult {
            key: request.key.clone(),
            note: request.note.clone(),
            status,
            call: None,
        }
    }
}

// ============================================================================
// FAULT-INJECTING LEASE STORE
// ============================================================================

/// Lease store that fails or stalls on demand.
///
/// Wraps an [`InMemoryLeaseStore`]; clones share both the slots and the
/// fault switches.
#[derive(Debug, Clone, Default)]
pub struct FlakyLeaseStore {
    inner: InMemoryLeaseStore,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    read_delay_ms: Arc<AtomicU64>,
}

impl FlakyLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share slots with an existing store.
    pub fn wrapping(inner: InMemoryLeaseStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn inner(&self) -> &InMemoryLeaseStore {
        &self.inner
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail writes, removals and swaps.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next read take `delay` to return. The slot is read before
    /// the pause, so the caller gets a value that other writers may have
    /// replaced by the time it arrives.
    pub fn delay_next_read(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.read_delay_ms.store(ms, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, op: &str) -> ParleyResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: format!("injected {} failure", op),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for FlakyLeaseStore {
    async fn read(&self, slot: &str) -> ParleyResult<Option<LeaseRecord>> {
        Self::check(&self.fail_reads, "read")?;
        let result = self.inner.read(slot).await;
        let delay_ms = self.read_delay_ms.swap(0, Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        result
    }

    async fn write(&self, slot: &str, record: LeaseRecord) -> ParleyResult<()> {
        Self::check(&self.fail_writes, "write")?;
        self.inner.write(slot, record).await
    }

    async fn remove(&self, slot: &str) -> ParleyResult<()> {
        Self::check(&self.fail_writes, "remove")?;
        self.inner.remove(slot).await
    }

    async fn compare_and_swap(
        &self,
        slot: &str,
        expected: Option<LeaseRecord>,
        new: Option<LeaseRecord>,
    ) -> ParleyResult<bool> {
        Self::check(&self.fail_reads, "read")?;
        Self::check(&self.fail_writes, "swap")?;
        self.inner.compare_and_swap(slot, expected, new).await
    }

    async fn remove_if_corrupted(&self, slot: &str) -> ParleyResult<bool> {
        Self::check(&self.fail_writes, "remove")?;
        self.inner.remove_if_corrupted(slot).await
    }

    fn supports_atomic_swap(&self) -> bool {
        self.inner.supports_atomic_swap()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Parley identity types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a valid address, in mixed case as users paste them.
    pub fn arb_address() -> impl Strategy<Value = Address> {
        (any::<[u8; 20]>(), any::<bool>()).prop_map(|(bytes, upper)| {
            let body = hex::encode(bytes);
            let raw = if upper {
                format!("0x{}", body.to_ascii_uppercase())
            } else {
                format!("0x{}", body)
            };
            Address::parse(&raw).expect("generated address is valid")
        })
    }

    pub fn arb_tx_hash() -> impl Strategy<Value = TxHash> {
        any::<[u8; 32]>().prop_map(|bytes| {
            TxHash::parse(&format!("0x{}", hex::encode(bytes))).expect("generated hash is valid")
        })
    }

    pub fn arb_chain_id() -> impl Strategy<Value = ChainId> {
        prop_oneof![
            Just(ChainId(1)),
            Just(ChainId(10)),
            Just(ChainId(8453)),
            (1u64..100_000).prop_map(ChainId),
        ]
    }

    pub fn arb_holder_id() -> impl Strategy<Value = HolderId> {
        any::<[u8; 16]>().prop_map(|b| HolderId::from_uuid(uuid_from_bytes(b)))
    }

    pub fn arb_conversation_id() -> impl Strategy<Value = ConversationId> {
        any::<[u8; 16]>().prop_map(|b| ConversationId::from_uuid(uuid_from_bytes(b)))
    }

    pub fn arb_lookup_status() -> impl Strategy<Value = LookupStatus> {
        prop_oneof![
            Just(LookupStatus::Pending),
            Just(LookupStatus::Confirmed),
            Just(LookupStatus::Failed),
        ]
    }

    fn uuid_from_bytes(bytes: [u8; 16]) -> uuid::Uuid {
        uuid::Uuid::from_bytes(bytes)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Common test configurations and instances.

    use super::*;
    use chrono::TimeZone;
    use parley_lease::LeaseManager;

    pub const SAMPLE_ADDRESS: &str = "0x71c7656ec7ab88b098defb751b7401b5f6d8976f";
    pub const SAMPLE_TX_HASH: &str =
        "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";

    /// A fixed instant, so timestamps in tests are reproducible.
    pub fn epoch() -> Timestamp {
        chrono::Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid fixed instant")
    }

    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch())
    }

    pub fn sample_address() -> Address {
        Address::parse(SAMPLE_ADDRESS).expect("sample address is valid")
    }

    pub fn sample_tx_hash() -> TxHash {
        TxHash::parse(SAMPLE_TX_HASH).expect("sample hash is valid")
    }

    /// Reference lease timings (2 s heartbeat, 5 s timeout) on `slot`.
    pub fn lease_config(slot: &str) -> LeaseConfig {
        LeaseConfig {
            slot: slot.to_string(),
            ..LeaseConfig::default()
        }
    }

    /// Full config with small capacities.
    pub fn test_config() -> ParleyConfig {
        let mut config = ParleyConfig::default();
        config.lease = lease_config("parley.test");
        config.cache.max_conversations = 4;
        config.cache.max_messages_per_conversation = 8;
        config.cache.max_usernames = 16;
        config
    }

    /// A lease manager on `store` driven by `clock`.
    pub fn lease_manager(
        store: Arc<dyn LeaseStore>,
        clock: &ManualClock,
        slot: &str,
    ) -> LeaseManager {
        LeaseManager::new(store, lease_config(slot)).with_clock(Arc::new(clock.clone()))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Parley-specific assertions.

    use super::*;
    use std::fmt::Debug;
    use std::hash::Hash;

    /// Assert the cache's keys, oldest first.
    pub fn assert_recency_order<K, V>(cache: &BoundedCache<K, V>, expected: &[K])
    where
        K: Eq + Hash + Clone + Debug,
    {
        let actual: Vec<K> = cache.keys().cloned().collect();
        assert_eq!(actual, expected, "cache recency order (oldest first)");
        assert!(
            cache.len() <= cache.capacity(),
            "cache size {} exceeds capacity {}",
            cache.len(),
            cache.capacity()
        );
    }

    /// Assert that `record` exists and names `holder`.
    pub fn assert_held_by(record: Option<LeaseRecord>, holder: HolderId) {
        match record {
            Some(record) => assert_eq!(
                record.holder_id, holder,
                "lease held by {} instead of {}",
                record.holder_id, holder
            ),
            None => panic!("expected a lease record held by {}, found none", holder),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_mock_lookup_consumes_script() {
        let mock = MockLookup::scripted(vec![
            MockOutcome::Status(LookupStatus::Pending),
            MockOutcome::Fail("down".to_string()),
        ]);
        let request = MockRequest::new("k");

        assert_eq!(mock.lookup(&request).await.unwrap().0, LookupStatus::Pending);
        assert!(mock.lookup(&request).await.is_err());
        assert_eq!(mock.lookup(&request).await.unwrap().0, LookupStatus::Confirmed);
        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.calls_for("k"), 3);
        assert_eq!(mock.max_in_flight_per_key(), 1);
    }

    #[tokio::test]
    async fn test_flaky_store_injects_failures() {
        let store = FlakyLeaseStore::new();
        let record = LeaseRecord::new(HolderId::now_v7(), fixtures::epoch());

        store.set_fail_writes(true);
        assert!(store.write("s", record).await.is_err());
        store.set_fail_writes(false);
        store.write("s", record).await.unwrap();

        store.set_fail_reads(true);
        assert!(store.read("s").await.is_err());
        store.set_fail_reads(false);
        assert_eq!(store.inner().read("s").await.unwrap(), Some(record));
    }

    #[test]
    fn test_fixture_config_is_valid() {
        fixtures::test_config().validate().unwrap();
    }
}

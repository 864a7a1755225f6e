//! Parley Storage - Process-Local Caches and Shared Lease Stores
//!
//! Two unrelated kinds of storage live here:
//!
//! - [`BoundedCache`]: a capacity-limited, process-local LRU map with an
//!   eviction callback, used by the message and username stores.
//! - [`LeaseStore`]: the single named slot shared by cooperating processes,
//!   with an in-memory backend (cooperating managers in one process) and an
//!   LMDB backend (cooperating OS processes).

pub mod cache;
pub mod lease_store;

pub use cache::{BoundedCache, CacheStats, EvictionCallback};
pub use lease_store::{InMemoryLeaseStore, LeaseStore, LmdbLeaseStore, LmdbLeaseStoreError};

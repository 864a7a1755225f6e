//! Capacity-limited LRU cache.
//!
//! Iteration order is recency order, oldest first. Every operation is O(1):
//! entries live in a dense `Vec` threaded by a doubly linked recency list, and
//! a `HashMap` maps keys to their slot.

pub mod lru;
pub mod stats;

pub use lru::{BoundedCache, EvictionCallback, Iter};
pub use stats::CacheStats;

//! Cache usage counters.

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups through `get` that found the key.
    pub hits: u64,
    /// Lookups through `get` that missed.
    pub misses: u64,
    /// New keys inserted by `set`.
    pub inserts: u64,
    /// Entries removed to enforce capacity or by `evict_to`.
    pub evictions: u64,
    /// Entries currently cached.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

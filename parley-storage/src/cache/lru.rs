//! [`BoundedCache`] implementation.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use super::stats::CacheStats;

/// Called with each evicted key and value, synchronously, inside the
/// operation that caused the eviction.
///
/// Not called for `delete` or `clear`. A panicking callback is caught and
/// logged; the eviction itself still happens.
pub type EvictionCallback<K, V> = Box<dyn FnMut(K, V) + Send>;

struct Entry<K, V> {
    key: K,
    value: V,
    /// Towards the oldest entry.
    prev: Option<usize>,
    /// Towards the newest entry.
    next: Option<usize>,
}

/// Fixed-capacity key-value store with least-recently-used eviction.
///
/// `len() <= capacity()` holds after every operation.
///
/// # Example
///
/// ```
/// use std::num::NonZeroUsize;
/// use parley_storage::BoundedCache;
///
/// let mut cache = BoundedCache::new(NonZeroUsize::new(2).unwrap());
/// cache.set("a", 1);
/// cache.set("b", 2);
/// cache.get(&"a");
/// cache.set("c", 3); // evicts "b"
///
/// assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec!["a", "c"]);
/// ```
pub struct BoundedCache<K, V> {
    capacity: NonZeroUsize,
    index: HashMap<K, usize>,
    entries: Vec<Entry<K, V>>,
    oldest: Option<usize>,
    newest: Option<usize>,
    on_evict: Option<EvictionCallback<K, V>>,
    stats: CacheStats,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            index: HashMap::with_capacity(capacity.get()),
            entries: Vec::with_capacity(capacity.get()),
            oldest: None,
            newest: None,
            on_evict: None,
            stats: CacheStats::default(),
        }
    }

    /// Create a cache that reports evictions to `on_evict`.
    pub fn with_eviction_callback(capacity: NonZeroUsize, on_evict: EvictionCallback<K, V>) -> Self {
        let mut cache = Self::new(capacity);
        cache.on_evict = Some(on_evict);
        cache
    }

    /// Value for `key`, promoting it to most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.lookup(key)?;
        self.promote(idx);
        Some(&self.entries[idx].value)
    }

    /// Mutable access to the value for `key`, promoting it.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.lookup(key)?;
        self.promote(idx);
        Some(&mut self.entries[idx].value)
    }

    /// Value for `key` without touching recency or statistics.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key).map(|&idx| &self.entries[idx].value)
    }

    /// Presence check. Never changes ordering.
    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Promote `key` to most recently used. Returns whether it existed.
    pub fn touch<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.index.get(key).copied() {
            Some(idx) => {
                self.promote(idx);
                true
            }
            None => false,
        }
    }

    /// Insert or replace `key`, making it most recently used.
    ///
    /// Replacing returns the previous value and never evicts. Inserting a new
    /// key into a full cache evicts the least recently used entry first.
    pub fn set(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&idx) = self.index.get(&key) {
            let previous = std::mem::replace(&mut self.entries[idx].value, value);
            self.promote(idx);
            return Some(previous);
        }

        if self.entries.len() >= self.capacity.get() {
            self.evict_oldest();
        }

        let idx = self.entries.len();
        self.entries.push(Entry {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.index.insert(key, idx);
        self.link_newest(idx);
        self.stats.inserts += 1;
        None
    }

    /// Mutable access to `key`, inserting `default()` first if it is absent.
    /// The entry is promoted either way.
    pub fn get_or_insert_with<F>(&mut self, key: K, default: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        if let Some(idx) = self.index.get(&key).copied() {
            self.promote(idx);
            return &mut self.entries[idx].value;
        }
        self.set(key, default());
        // New entries are always pushed last.
        let idx = self.entries.len() - 1;
        &mut self.entries[idx].value
    }

    /// Remove `key` without invoking the eviction callback.
    pub fn delete<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.index.get(key).copied()?;
        let (_, value) = self.remove_at(idx);
        Some(value)
    }

    /// Evict least recently used entries until `len() <= target_size`.
    /// Returns the number evicted.
    pub fn evict_to(&mut self, target_size: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > target_size && self.evict_oldest() {
            evicted += 1;
        }
        evicted
    }

    /// Remove every entry without invoking the eviction callback.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.oldest = None;
        self.newest = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Least recently used key (next to be evicted).
    pub fn oldest_key(&self) -> Option<&K> {
        self.oldest.map(|idx| &self.entries[idx].key)
    }

    /// Most recently used key.
    pub fn newest_key(&self) -> Option<&K> {
        self.newest.map(|idx| &self.entries[idx].key)
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            entries: &self.entries,
            cursor: self.oldest,
            remaining: self.entries.len(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, v)| v)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.entries.len() as u64,
            ..self.stats
        }
    }

    fn lookup<Q>(&mut self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.index.get(key).copied() {
            Some(idx) => {
                self.stats.hits += 1;
                Some(idx)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some(idx) = self.oldest else {
            return false;
        };
        let (key, value) = self.remove_at(idx);
        self.stats.evictions += 1;
        if let Some(on_evict) = self.on_evict.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| on_evict(key, value))).is_err() {
                warn!(capacity = self.capacity.get(), "Eviction callback panicked");
            }
        }
        true
    }

    fn promote(&mut self, idx: usize) {
        if self.newest == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_newest(idx);
    }

    fn link_newest(&mut self, idx: usize) {
        self.entries[idx].prev = self.newest;
        self.entries[idx].next = None;
        match self.newest {
            Some(newest) => self.entries[newest].next = Some(idx),
            None => self.oldest = Some(idx),
        }
        self.newest = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.entries[idx].prev, self.entries[idx].next);
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.oldest = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.newest = prev,
        }
    }

    /// Unlink and remove the entry at `idx`, moving the last entry into its
    /// slot.
    fn remove_at(&mut self, idx: usize) -> (K, V) {
        self.unlink(idx);
        let removed = self.entries.swap_remove(idx);
        self.index.remove(&removed.key);

        if idx < self.entries.len() {
            let (prev, next) = (self.entries[idx].prev, self.entries[idx].next);
            match prev {
                Some(p) => self.entries[p].next = Some(idx),
                None => self.oldest = Some(idx),
            }
            match next {
                Some(n) => self.entries[n].prev = Some(idx),
                None => self.newest = Some(idx),
            }
            if let Some(slot) = self.index.get_mut(&self.entries[idx].key) {
                *slot = idx;
            }
        }

        (removed.key, removed.value)
    }
}

impl<K, V> fmt::Debug for BoundedCache<K, V>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = Iter {
            entries: &self.entries,
            cursor: self.oldest,
            remaining: self.entries.len(),
        };
        f.debug_struct("BoundedCache")
            .field("capacity", &self.capacity)
            .field("entries", &DebugEntries(entries))
            .field("has_eviction_callback", &self.on_evict.is_some())
            .finish()
    }
}

struct DebugEntries<'a, K, V>(Iter<'a, K, V>);

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for DebugEntries<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.clone()).finish()
    }
}

/// Iterator over cache entries, oldest first.
pub struct Iter<'a, K, V> {
    entries: &'a [Entry<K, V>],
    cursor: Option<usize>,
    remaining: usize,
}

impl<K, V> Clone for Iter<'_, K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries,
            cursor: self.cursor,
            remaining: self.remaining,
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let entry = &self.entries[idx];
        self.cursor = entry.next;
        self.remaining = self.remaining.saturating_sub(1);
        Some((&entry.key, &entry.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

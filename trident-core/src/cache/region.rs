//! Byte-bounded LRU cache regions.
//!
//! A region charges every entry its byte cost (payload weight plus a fixed
//! bookkeeping overhead) and evicts least-recently-used entries until the
//! total fits its capacity. Eviction takes the region lock once per evicted
//! entry, so a reader waits for at most one eviction step.

use std::hash::Hash;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::cache::RegionKind;

/// Bytes charged per entry on top of its payload (key, LRU links, weight).
pub const ENTRY_OVERHEAD_BYTES: u64 = 64;

/// Default number of eviction steps an insert may perform.
pub const DEFAULT_MAX_EVICTIONS_PER_CALL: usize = 64;

/// Values that know their approximate in-memory size.
pub trait Weighted {
    /// Approximate heap size in bytes.
    fn weight(&self) -> usize;
}

impl Weighted for [f32] {
    fn weight(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

impl<T: Weighted + ?Sized> Weighted for Arc<T> {
    fn weight(&self) -> usize {
        (**self).weight()
    }
}

impl<T: Weighted> Weighted for Vec<T> {
    fn weight(&self) -> usize {
        self.iter().map(Weighted::weight).sum()
    }
}

/// Point-in-time counters for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionStats {
    pub kind: RegionKind,
    pub entries: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Type-erased view of a region, used by the manager to resize it.
pub trait Region: Send + Sync {
    fn kind(&self) -> RegionKind;
    fn set_capacity(&self, bytes: u64);
    fn stats(&self) -> RegionStats;
    fn clear(&self);
}

struct RegionState<K: Hash + Eq, V> {
    entries: LruCache<K, (V, u64)>,
    used: u64,
    capacity: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// A byte-bounded LRU cache.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trident_core::cache::{CacheRegion, RegionKind};
///
/// let region: CacheRegion<u64, Arc<[f32]>> = CacheRegion::new(RegionKind::IndexLayer, 4096);
/// region.insert(1, Arc::from(vec![0.5f32; 8]));
/// assert!(region.get(&1).is_some());
/// ```
pub struct CacheRegion<K: Hash + Eq, V> {
    kind: RegionKind,
    state: Mutex<RegionState<K, V>>,
    max_evictions_per_call: usize,
}

impl<K, V> CacheRegion<K, V>
where
    K: Hash + Eq,
    V: Clone + Weighted,
{
    /// Creates an empty region with the given byte capacity.
    pub fn new(kind: RegionKind, capacity_bytes: u64) -> Self {
        Self {
            kind,
            state: Mutex::new(RegionState {
                entries: LruCache::unbounded(),
                used: 0,
                capacity: capacity_bytes,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_evictions_per_call: DEFAULT_MAX_EVICTIONS_PER_CALL,
        }
    }

    /// Sets how many eviction steps a single insert may perform. An insert
    /// that cannot make room within that many steps is not cached.
    pub fn with_max_evictions_per_call(mut self, steps: usize) -> Self {
        self.max_evictions_per_call = steps.max(1);
        self
    }

    /// Looks up `key`, marking it most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        match state.entries.get(key).map(|(value, _)| value.clone()) {
            Some(value) => {
                state.hits += 1;
                Some(value)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Evicts least-recently-used entries until `value` fits, then inserts it.
    ///
    /// Returns false if the entry is larger than the region or room could not
    /// be made within the per-insert eviction limit. Such an entry is not
    /// cached, and any previous value for `key` is dropped.
    pub fn insert(&self, key: K, value: V) -> bool {
        let cost = value.weight() as u64 + ENTRY_OVERHEAD_BYTES;
        let mut steps = 0;
        loop {
            let mut state = self.state.lock();
            if steps == 0 {
                if let Some((_, old_cost)) = state.entries.pop(&key) {
                    state.used -= old_cost;
                }
                if cost > state.capacity {
                    return false;
                }
            }
            if state.used + cost <= state.capacity {
                state.entries.put(key, (value, cost));
                state.used += cost;
                return true;
            }
            if steps == self.max_evictions_per_call {
                tracing::trace!(region = ?self.kind, cost, "insert skipped, eviction limit reached");
                return false;
            }
            match state.entries.pop_lru() {
                Some((_, (_, evicted_cost))) => {
                    state.used -= evicted_cost;
                    state.evictions += 1;
                }
                None => state.used = 0,
            }
            steps += 1;
        }
    }

    /// Removes `key` from the region.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        let (value, cost) = state.entries.pop(key)?;
        state.used -= cost;
        Some(value)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged to the region.
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    /// Current capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.state.lock().capacity
    }

    /// Evicts up to `max_steps` entries, one lock acquisition per entry.
    fn evict(&self, max_steps: usize) -> usize {
        let mut evicted = 0;
        while evicted < max_steps {
            let mut state = self.state.lock();
            if state.used <= state.capacity {
                break;
            }
            match state.entries.pop_lru() {
                Some((_, (_, cost))) => {
                    state.used -= cost;
                    state.evictions += 1;
                    evicted += 1;
                }
                None => {
                    state.used = 0;
                    break;
                }
            }
        }
        evicted
    }
}

impl<K, V> Region for CacheRegion<K, V>
where
    K: Hash + Eq + Send,
    V: Clone + Weighted + Send,
{
    fn kind(&self) -> RegionKind {
        self.kind
    }

    fn set_capacity(&self, bytes: u64) {
        self.state.lock().capacity = bytes;
        let evicted = self.evict(usize::MAX);
        if evicted > 0 {
            tracing::debug!(region = ?self.kind, evicted, capacity = bytes, "region shrunk");
        }
    }

    fn stats(&self) -> RegionStats {
        let state = self.state.lock();
        RegionStats {
            kind: self.kind,
            entries: state.entries.len(),
            used_bytes: state.used,
            capacity_bytes: state.capacity,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(len: usize) -> Arc<[f32]> {
        Arc::from(vec![1.0f32; len])
    }

    /// Cost of a vector entry with `len` components.
    fn cost(len: usize) -> u64 {
        len as u64 * 4 + ENTRY_OVERHEAD_BYTES
    }

    #[test]
    fn test_insert_and_get() {
        let region = CacheRegion::new(RegionKind::IndexLayer, 1024);
        assert!(region.insert(1u64, vector(4)));
        assert_eq!(region.get(&1).map(|v| v.len()), Some(4));
        assert!(region.get(&2).is_none());

        let stats = region.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.used_bytes, cost(4));
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let region = CacheRegion::new(RegionKind::IndexLayer, cost(16) * 3);
        region.insert(1u64, vector(16));
        region.insert(2u64, vector(16));
        region.insert(3u64, vector(16));

        // Touch 1 so 2 becomes the eviction candidate.
        region.get(&1);
        region.insert(4u64, vector(16));

        assert!(region.get(&1).is_some());
        assert!(region.get(&2).is_none());
        assert!(region.get(&3).is_some());
        assert!(region.get(&4).is_some());
        assert_eq!(region.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_is_size_aware() {
        let region = CacheRegion::new(RegionKind::Metadata, cost(8) * 4);
        for id in 0..4u64 {
            region.insert(id, vector(8));
        }
        // One large entry pushes out several small ones.
        region.insert(100u64, vector(20));
        assert!(region.used_bytes() <= region.capacity_bytes());
        assert!(region.len() < 5);
        assert!(region.get(&100).is_some());
    }

    #[test]
    fn test_oversized_entry_is_not_cached() {
        let region = CacheRegion::new(RegionKind::QueryResult, 128);
        assert!(!region.insert(1u64, vector(1024)));
        assert!(region.is_empty());
        assert_eq!(region.used_bytes(), 0);
    }

    #[test]
    fn test_replacing_entry_updates_accounting() {
        let region = CacheRegion::new(RegionKind::IndexLayer, 4096);
        region.insert(1u64, vector(4));
        region.insert(1u64, vector(8));
        assert_eq!(region.len(), 1);
        assert_eq!(region.used_bytes(), cost(8));
        region.remove(&1);
        assert_eq!(region.used_bytes(), 0);
    }

    #[test]
    fn test_set_capacity_shrinks() {
        let region = CacheRegion::new(RegionKind::IndexLayer, cost(4) * 10);
        for id in 0..10u64 {
            region.insert(id, vector(4));
        }
        region.set_capacity(cost(4) * 3);
        assert_eq!(region.len(), 3);
        // Most recent entries survive.
        assert!(region.get(&9).is_some());
        assert!(region.get(&0).is_none());
    }

    #[test]
    fn test_eviction_steps_are_capped_per_insert() {
        let region =
            CacheRegion::new(RegionKind::IndexLayer, cost(1) * 10).with_max_evictions_per_call(2);
        for id in 0..10u64 {
            region.insert(id, vector(1));
        }
        // Needs five evictions to fit, so it is refused after two.
        assert!(!region.insert(99u64, vector(64)));
        assert_eq!(region.stats().evictions, 2);
        assert!(region.get(&99).is_none());
        assert!(region.used_bytes() <= region.capacity_bytes());
        assert_eq!(region.len(), 8);

        // Small entries still fit.
        assert!(region.insert(100u64, vector(1)));
        assert!(region.used_bytes() <= region.capacity_bytes());
    }
}

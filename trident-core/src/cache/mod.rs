//! Adaptive cache budget and byte-bounded cache regions.
//!
//! The [`CacheManager`] owns one [`CacheBudget`] split into weighted
//! partitions, one per [`RegionKind`]. Components ask the manager for a
//! [`CacheRegion`] of a given kind; the region's capacity is its share of
//! that partition. The budget only changes through [`CacheManager::resize`].

pub mod probe;
pub mod region;

pub use probe::{
    detect_optimal_cache_size, BudgetDetector, BudgetSource, MemoryProbe, MemorySnapshot,
    StaticMemoryProbe, SystemMemoryProbe, CONSERVATIVE_FREE_BYTES, CONSERVATIVE_TOTAL_BYTES,
    MIN_DETECTED_BUDGET_BYTES,
};
pub use region::{CacheRegion, Region, RegionStats, Weighted};

use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Default share of free memory given to caches.
pub const DEFAULT_MEMORY_FRACTION: f64 = 0.25;
/// Smallest partition a budget may produce.
pub const MIN_PARTITION_BYTES: u64 = 4096;

/// Kinds of cached data, each with its own partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Paged vector payloads of the index.
    IndexLayer,
    /// Decoded record documents.
    Metadata,
    /// Finished query results.
    QueryResult,
}

impl RegionKind {
    /// All kinds in partition order.
    pub const ALL: [RegionKind; 3] = [
        RegionKind::IndexLayer,
        RegionKind::Metadata,
        RegionKind::QueryResult,
    ];

    /// Share of the total budget, in thousandths.
    pub fn weight_per_mille(self) -> u64 {
        match self {
            RegionKind::IndexLayer => 600,
            RegionKind::Metadata => 250,
            RegionKind::QueryResult => 150,
        }
    }
}

/// One slice of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub kind: RegionKind,
    pub bytes: u64,
}

/// A total byte budget and its partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheBudget {
    total_bytes: u64,
    source: BudgetSource,
    partitions: Vec<Partition>,
}

impl CacheBudget {
    /// Splits `total_bytes` by the region weights. The last partition takes
    /// the rounding remainder, so the partitions always sum to the total.
    pub fn partitioned(total_bytes: u64, source: BudgetSource) -> Result<Self> {
        let mut partitions = Vec::with_capacity(RegionKind::ALL.len());
        let mut assigned = 0u64;
        for (i, kind) in RegionKind::ALL.iter().enumerate() {
            let bytes = if i + 1 == RegionKind::ALL.len() {
                total_bytes - assigned
            } else {
                total_bytes / 1000 * kind.weight_per_mille()
                    + total_bytes % 1000 * kind.weight_per_mille() / 1000
            };
            if bytes < MIN_PARTITION_BYTES {
                return Err(Error::CacheBudgetInvalid(format!(
                    "budget of {} bytes leaves {:?} with {} bytes (minimum {})",
                    total_bytes, kind, bytes, MIN_PARTITION_BYTES
                )));
            }
            assigned += bytes;
            partitions.push(Partition { kind: *kind, bytes });
        }

        Ok(Self {
            total_bytes,
            source,
            partitions,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn source(&self) -> &BudgetSource {
        &self.source
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Bytes assigned to `kind`.
    pub fn partition_bytes(&self, kind: RegionKind) -> u64 {
        self.partitions
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.bytes)
            .unwrap_or(0)
    }
}

struct Registered {
    kind: RegionKind,
    region: Weak<dyn Region>,
}

/// Hands out cache regions and keeps them within the budget.
///
/// Regions are tracked weakly: dropping the last `Arc` to a region returns
/// its share to the other regions of the same kind on the next
/// registration or resize.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trident_core::cache::{BudgetDetector, CacheManager, RegionKind};
///
/// let budget = BudgetDetector::new(0.25).unwrap().detect(Some(1 << 20)).unwrap();
/// let manager = CacheManager::new(budget);
/// let region = manager.register::<u64, Arc<[f32]>>(RegionKind::IndexLayer);
/// assert_eq!(region.capacity_bytes(), manager.budget().partition_bytes(RegionKind::IndexLayer));
///
/// manager.resize(2 << 20).unwrap();
/// assert_eq!(manager.budget().total_bytes(), 2 << 20);
/// ```
pub struct CacheManager {
    budget: RwLock<CacheBudget>,
    regions: Mutex<Vec<Registered>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("budget", &*self.budget.read())
            .field("regions", &self.regions.lock().len())
            .finish()
    }
}

impl CacheManager {
    /// Creates a manager for an already computed budget.
    pub fn new(budget: CacheBudget) -> Self {
        Self {
            budget: RwLock::new(budget),
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Detects a budget with `detector` and creates a manager for it.
    pub fn detect(detector: &BudgetDetector, explicit_override: Option<i64>) -> Result<Self> {
        Ok(Self::new(detector.detect(explicit_override)?))
    }

    /// Current budget.
    pub fn budget(&self) -> CacheBudget {
        self.budget.read().clone()
    }

    /// Creates a region of `kind`. Regions of one kind split its partition
    /// evenly, so registering a second region halves the first.
    pub fn register<K, V>(&self, kind: RegionKind) -> Arc<CacheRegion<K, V>>
    where
        K: Hash + Eq + Send + 'static,
        V: Clone + Weighted + Send + 'static,
    {
        let region = Arc::new(CacheRegion::new(kind, 0));
        let erased: Arc<dyn Region> = region.clone();

        let partition = self.budget.read().partition_bytes(kind);
        let mut regions = self.regions.lock();
        regions.push(Registered {
            kind,
            region: Arc::downgrade(&erased),
        });
        Self::rebalance(&mut regions, kind, partition);
        region
    }

    /// Replaces the total budget and resizes every live region.
    ///
    /// Shrinking evicts immediately. Values already handed out stay valid
    /// for whoever holds them.
    pub fn resize(&self, new_total_bytes: u64) -> Result<CacheBudget> {
        if new_total_bytes == 0 {
            return Err(Error::CacheBudgetInvalid(
                "budget must be positive".to_string(),
            ));
        }
        let budget = CacheBudget::partitioned(new_total_bytes, BudgetSource::Resized)?;

        let mut regions = self.regions.lock();
        let previous = std::mem::replace(&mut *self.budget.write(), budget.clone());
        for kind in RegionKind::ALL {
            Self::rebalance(&mut regions, kind, budget.partition_bytes(kind));
        }

        tracing::info!(
            from_bytes = previous.total_bytes(),
            to_bytes = budget.total_bytes(),
            "cache budget resized"
        );
        Ok(budget)
    }

    /// Counters for every live region.
    pub fn stats(&self) -> Vec<RegionStats> {
        self.live_regions().iter().map(|r| r.stats()).collect()
    }

    /// Empties every live region without changing capacities.
    pub fn clear(&self) {
        for region in self.live_regions() {
            region.clear();
        }
    }

    fn live_regions(&self) -> Vec<Arc<dyn Region>> {
        self.regions
            .lock()
            .iter()
            .filter_map(|r| r.region.upgrade())
            .collect()
    }

    fn rebalance(regions: &mut Vec<Registered>, kind: RegionKind, partition_bytes: u64) {
        regions.retain(|r| r.region.strong_count() > 0);
        let live: Vec<Arc<dyn Region>> = regions
            .iter()
            .filter(|r| r.kind == kind)
            .filter_map(|r| r.region.upgrade())
            .collect();
        if live.is_empty() {
            return;
        }
        let share = partition_bytes / live.len() as u64;
        for region in live {
            region.set_capacity(share);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(total: u64) -> CacheManager {
        CacheManager::new(CacheBudget::partitioned(total, BudgetSource::Override).unwrap())
    }

    fn vector(len: usize) -> Arc<[f32]> {
        Arc::from(vec![0.0f32; len])
    }

    #[test]
    fn test_partitions_sum_to_total() {
        for total in [27_307u64, 1_000_003, 1 << 30, 12_345_678_901] {
            let budget = CacheBudget::partitioned(total, BudgetSource::Override).unwrap();
            let sum: u64 = budget.partitions().iter().map(|p| p.bytes).sum();
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn test_partition_weights() {
        let budget = CacheBudget::partitioned(1_000_000, BudgetSource::Override).unwrap();
        assert_eq!(budget.partition_bytes(RegionKind::IndexLayer), 600_000);
        assert_eq!(budget.partition_bytes(RegionKind::Metadata), 250_000);
        assert_eq!(budget.partition_bytes(RegionKind::QueryResult), 150_000);
    }

    #[test]
    fn test_register_sizes_region_to_partition() {
        let manager = manager(1_000_000);
        let first = manager.register::<u64, Arc<[f32]>>(RegionKind::Metadata);
        assert_eq!(first.capacity_bytes(), 250_000);

        let second = manager.register::<u64, Arc<[f32]>>(RegionKind::Metadata);
        assert_eq!(first.capacity_bytes(), 125_000);
        assert_eq!(second.capacity_bytes(), 125_000);

        drop(second);
        let third = manager.register::<u64, Arc<[f32]>>(RegionKind::Metadata);
        assert_eq!(first.capacity_bytes(), 125_000);
        assert_eq!(third.capacity_bytes(), 125_000);
        assert_eq!(manager.stats().len(), 2);
    }

    #[test]
    fn test_resize_shrinks_live_regions() {
        let manager = manager(1_000_000);
        let region = manager.register::<u64, Arc<[f32]>>(RegionKind::IndexLayer);
        for id in 0..500u64 {
            region.insert(id, vector(256));
        }
        assert!(region.used_bytes() <= 600_000);

        let held = region.get(&499).unwrap();
        let budget = manager.resize(100_000).unwrap();
        assert_eq!(budget.source(), &BudgetSource::Resized);
        assert_eq!(region.capacity_bytes(), 60_000);
        assert!(region.used_bytes() <= 60_000);
        // A value read before the resize stays usable.
        assert_eq!(held.len(), 256);
    }

    #[test]
    fn test_resize_rejects_invalid_budget() {
        let manager = manager(1_000_000);
        assert!(manager.resize(0).is_err());
        assert!(manager.resize(100).is_err());
        assert_eq!(manager.budget().total_bytes(), 1_000_000);
    }

    #[test]
    fn test_clear_empties_regions() {
        let manager = manager(1_000_000);
        let region = manager.register::<u64, Arc<[f32]>>(RegionKind::QueryResult);
        region.insert(1, vector(4));
        manager.clear();
        assert!(region.is_empty());
    }
}

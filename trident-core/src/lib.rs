//! # Trident Core
//!
//! Core library for Trident, an embeddable vector-search engine that
//! combines approximate nearest-neighbor search with graph-relationship
//! and facet filtering.
//!
//! ## Core Types
//!
//! ### Index
//!
//! - [`HnswIndex`] - concurrent HNSW graph with tombstone deletion,
//!   compaction, deadline-aware search and a checksummed snapshot format
//!
//! ### Store
//!
//! - [`UnifiedStore`] - records with metadata, facets and edges; filtered
//!   queries with oversampling and widening
//! - [`QueryFilter`] - facet predicates plus an optional graph constraint
//!
//! ### Services
//!
//! - [`EngineContext`] - cache manager, key-value store and optional
//!   embedding provider shared by stores
//! - [`CacheManager`] - detected memory budget split into byte-bounded
//!   LRU regions
//! - [`EmbeddingProvider`] - single-flight model resolution from local and
//!   (if permitted) remote repositories
//!
//! ### Persistence
//!
//! - [`KvStore`] - the byte store everything persists through
//! - [`MemoryKvStore`], [`FileKvStore`] - bundled implementations
//!
//! ## Example
//!
//! ```
//! use trident_core::prelude::*;
//!
//! let config = EngineConfig::new(2)
//!     .with_metric(DistanceMetric::Euclidean)
//!     .with_cache_budget_bytes(1 << 20);
//! let ctx = EngineContext::from_config(&config).unwrap();
//! let store = UnifiedStore::open(&ctx, config).unwrap();
//!
//! store.insert(VectorRecord::new(1, vec![1.0, 0.0])).unwrap();
//! store.insert(VectorRecord::new(2, vec![0.0, 1.0])).unwrap();
//! store.insert(VectorRecord::new(3, vec![0.9, 0.1])).unwrap();
//!
//! let hits = store.query_vector(&[1.0, 0.0], 2, &QueryFilter::new()).unwrap();
//! assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 3]);
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod distance;
pub mod embedding;
pub mod error;
pub mod index;
pub mod storage;
pub mod store;
pub mod vector;

// Re-exports for convenient access
pub use cache::{
    detect_optimal_cache_size, BudgetDetector, BudgetSource, CacheBudget, CacheManager,
    CacheRegion, RegionKind,
};
pub use config::{EngineConfig, VectorResidency};
pub use context::{EngineContext, EngineContextBuilder};
pub use distance::DistanceMetric;
pub use embedding::{
    EmbeddingModel, EmbeddingProvider, HashingModel, ModelOrigin, ModelRepository, ModelSource,
    ModelStatus, RemotePolicy, StaticRepository,
};
pub use error::{Error, Result};
pub use index::{
    CancelFlag, HnswConfig, HnswIndex, NodeState, SearchOptions, SearchOutcome, SearchResult,
};
pub use storage::{FileKvStore, KvStore, MemoryKvStore};
pub use store::{
    Direction, FacetPredicate, FacetValue, GraphConstraint, QueryFilter, QueryHit, QueryInput,
    RecordAttributes, UnifiedStore, VectorRecord,
};
pub use vector::{Vector, VectorId};

/// Re-export commonly used types for convenience.
///
/// # Example
///
/// ```rust
/// use trident_core::prelude::*;
///
/// let index = HnswIndex::new(DistanceMetric::Euclidean, 3, HnswConfig::default());
/// index.insert(1, vec![1.0, 2.0, 3.0]).unwrap();
/// assert_eq!(index.search(&[1.0, 2.0, 3.0], 1, None).unwrap()[0].id, 1);
/// ```
pub mod prelude {
    pub use crate::{
        CacheManager, DistanceMetric, EmbeddingProvider, EngineConfig, EngineContext, Error,
        FacetValue, HnswConfig, HnswIndex, KvStore, QueryFilter, QueryHit, QueryInput,
        RecordAttributes, Result, SearchResult, UnifiedStore, VectorId, VectorRecord,
    };
}

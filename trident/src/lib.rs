//! # Trident
//!
//! **Embeddable vector search combining ANN, graph relationships and facets.**
//!
//! Trident answers "what is close to this?" and narrows the answer with
//! two more kinds of knowledge about your records:
//!
//! - **Facets** - discrete attributes (`lang = "rust"`, `year = 2024`)
//! - **Relationships** - directed edges between records, filtered by hop
//!   distance from an anchor
//!
//! ## Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **HNSW Index** | Concurrent inserts and searches, tombstones, compaction |
//! | **Distance Metrics** | Cosine, Euclidean |
//! | **Filtered Search** | Facet predicates and graph reachability with widening |
//! | **Embeddings** | Local-first model sourcing with an explicit remote policy |
//! | **Adaptive Cache** | Memory-probed budget split into LRU regions |
//! | **Persistence** | Checksummed snapshots over any key-value store |
//!
//! ## Quick Start
//!
//! ```rust
//! use trident::prelude::*;
//!
//! let config = EngineConfig::new(3)
//!     .with_metric(DistanceMetric::Euclidean)
//!     .with_cache_budget_bytes(1 << 20);
//! let ctx = EngineContext::from_config(&config).unwrap();
//! let store = UnifiedStore::open(&ctx, config).unwrap();
//!
//! store
//!     .insert(VectorRecord::new(1, vec![1.0, 0.0, 0.0]).with_facet("category", "A"))
//!     .unwrap();
//! store
//!     .insert(VectorRecord::new(2, vec![0.9, 0.1, 0.0]).with_facet("category", "B"))
//!     .unwrap();
//! store
//!     .insert(VectorRecord::new(3, vec![0.8, 0.2, 0.0]).with_facet("category", "A"))
//!     .unwrap();
//!
//! // Search only category A
//! let filter = QueryFilter::new().facet_eq("category", "A");
//! let hits = store.query_vector(&[1.0, 0.0, 0.0], 10, &filter).unwrap();
//! assert_eq!(hits.len(), 2);
//! ```
//!
//! ### Graph Constraints
//!
//! ```rust
//! use trident::prelude::*;
//!
//! let config = EngineConfig::new(2).with_cache_budget_bytes(1 << 20);
//! let ctx = EngineContext::from_config(&config).unwrap();
//! let store = UnifiedStore::open(&ctx, config).unwrap();
//!
//! store.insert(VectorRecord::new(1, vec![1.0, 0.0]).with_edge(2)).unwrap();
//! store.insert(VectorRecord::new(2, vec![0.0, 1.0])).unwrap();
//! store.insert(VectorRecord::new(3, vec![0.1, 1.0])).unwrap();
//!
//! // Only records one hop away from record 1.
//! let filter = QueryFilter::new().within_hops(1, 1);
//! let hits = store.query_vector(&[0.0, 1.0], 10, &filter).unwrap();
//! assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![2]);
//! ```
//!
//! ### Persistent Store
//!
//! ```no_run
//! use std::sync::Arc;
//! use trident::prelude::*;
//! use trident::FileKvStore;
//!
//! fn main() -> Result<()> {
//!     let config = EngineConfig::new(384).apply_env()?;
//!     let ctx = EngineContext::builder()
//!         .memory_fraction(config.memory_fraction)
//!         .cache_budget_override(config.cache_budget_bytes)
//!         .kv_store(Arc::new(FileKvStore::open("./my_vectors")?))
//!         .build()?;
//!
//!     let store = UnifiedStore::open(&ctx, config)?;
//!     store.insert(VectorRecord::new(1, vec![0.1; 384]).with_metadata("doc", "example"))?;
//!     store.save()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Trident is organized into two crates:
//!
//! - **`trident-core`** - the engine
//! - **`trident`** - main crate that re-exports everything
//!
//! ### Core Components
//!
//! - [`HnswIndex`] - approximate nearest neighbor graph
//! - [`UnifiedStore`] - records, facets, edges and filtered queries
//! - [`EmbeddingProvider`] - content to vector, single-flight per model
//! - [`CacheManager`] - budget detection and cache regions
//! - [`EngineContext`] - services shared by stores
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`](crate::Result), which uses
//! the [`Error`] enum for error types.
//!
//! ## Thread Safety
//!
//! [`HnswIndex`] and [`UnifiedStore`] take `&self` for every operation and
//! are safe to share behind an `Arc`. Searches never block on an index-wide
//! lock; only compaction and snapshots pause writers.

// Re-export everything from core
pub use trident_core::*;

//! Unified store: vector search combined with facet and graph filters.
//!
//! A [`UnifiedStore`] owns [`VectorRecord`]s. Vectors go to the
//! [`HnswIndex`]; facets feed a roaring-bitmap [`FacetIndex`]; edges feed a
//! [`RelationGraph`]. Queries search the index with oversampling, keep the
//! candidates that pass the filter and widen the beam while too few survive.
//!
//! Persistence layout in the key-value store, below the store's name
//! (`EngineConfig::store_name`):
//!
//! - `<name>/rec/<id>`: JSON [`RecordAttributes`] of each record.
//! - `<name>/index/snapshot`: binary index snapshot written by
//!   [`UnifiedStore::save`].
//! - `<name>/vec/<id>`: raw vectors, only when vectors are paged.

pub mod facets;
pub mod graph;
pub mod query;
pub mod record;

pub use facets::FacetIndex;
pub use graph::RelationGraph;
pub use query::{Direction, FacetPredicate, GraphConstraint, QueryFilter};

use query::QueryKey;
pub use record::{FacetValue, Metadata, RecordAttributes, VectorRecord};

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheRegion, Region, RegionKind, Weighted};
use crate::config::{EngineConfig, VectorResidency};
use crate::context::{EngineContext, StoreClaim};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::index::{vectors, HnswIndex, SearchOptions, SearchResult, VectorStorage};
use crate::storage::{id_from_key, KvStore, Keyspace};
use crate::vector::{check_dimension, VectorId};

/// One ranked query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub id: VectorId,
    pub distance: f32,
    pub metadata: Metadata,
}

impl Weighted for QueryHit {
    fn weight(&self) -> usize {
        let metadata: usize = self
            .metadata
            .iter()
            .map(|(k, v)| k.len() + record::json_weight(v))
            .sum();
        16 + metadata
    }
}

/// What to search for.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    /// A ready vector.
    Vector(Vec<f32>),
    /// Content to embed with the context's provider.
    Content(String),
}

impl From<Vec<f32>> for QueryInput {
    fn from(vector: Vec<f32>) -> Self {
        QueryInput::Vector(vector)
    }
}

impl From<&str> for QueryInput {
    fn from(content: &str) -> Self {
        QueryInput::Content(content.to_string())
    }
}

impl From<String> for QueryInput {
    fn from(content: String) -> Self {
        QueryInput::Content(content)
    }
}

/// A cached result with the full query it answers. The cache is keyed by
/// a hash, so a hit is only used when the stored query matches exactly.
#[derive(Debug)]
struct CachedQuery {
    key: QueryKey,
    hits: Vec<QueryHit>,
}

impl Weighted for CachedQuery {
    fn weight(&self) -> usize {
        self.key.weight() + self.hits.weight()
    }
}

/// Facet and graph state, updated together.
#[derive(Debug, Default)]
struct FilterState {
    facets: FacetIndex,
    graph: RelationGraph,
}

/// Vector store with facet and graph filtering.
///
/// # Example
///
/// ```
/// use trident_core::store::{QueryFilter, UnifiedStore, VectorRecord};
/// use trident_core::{DistanceMetric, EngineConfig, EngineContext};
///
/// let config = EngineConfig::new(2)
///     .with_metric(DistanceMetric::Euclidean)
///     .with_cache_budget_bytes(1 << 20);
/// let ctx = EngineContext::from_config(&config).unwrap();
/// let store = UnifiedStore::open(&ctx, config).unwrap();
///
/// store.insert(VectorRecord::new(1, vec![1.0, 0.0]).with_facet("lang", "rust")).unwrap();
/// store.insert(VectorRecord::new(2, vec![0.9, 0.1]).with_facet("lang", "go")).unwrap();
///
/// let filter = QueryFilter::new().facet_eq("lang", "go");
/// let hits = store.query_vector(&[1.0, 0.0], 5, &filter).unwrap();
/// assert_eq!(hits.len(), 1);
/// assert_eq!(hits[0].id, 2);
/// ```
pub struct UnifiedStore {
    config: EngineConfig,
    index: HnswIndex,
    kv: Arc<dyn KvStore>,
    keys: Keyspace,
    embedder: Option<Arc<EmbeddingProvider>>,
    filters: RwLock<FilterState>,
    records: Arc<CacheRegion<VectorId, Arc<RecordAttributes>>>,
    results: Arc<CacheRegion<u64, Arc<CachedQuery>>>,
    /// Bumped by every mutation; a query only caches its result if no
    /// mutation happened while it ran.
    generation: AtomicU64,
    _claim: StoreClaim,
}

impl std::fmt::Debug for UnifiedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedStore")
            .field("name", &self.keys.name())
            .field("dimension", &self.config.dimension)
            .field("len", &self.index.len())
            .field("paged", &self.index.is_paged())
            .finish()
    }
}

impl UnifiedStore {
    /// Opens a store on the context's key-value store, loading a saved
    /// snapshot and the persisted records if present.
    ///
    /// Only the keys under `config.store_name` are read or written. Opening
    /// a name that is already open on `ctx` fails with `InvalidConfig`.
    pub fn open(ctx: &EngineContext, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let keys = Keyspace::new(config.store_name.as_str())?;
        if let Some(embedder) = ctx.embedder() {
            if embedder.dimension() != config.dimension {
                return Err(Error::InvalidConfig(format!(
                    "embedding provider produces {} dimensions but the store expects {}",
                    embedder.dimension(),
                    config.dimension
                )));
            }
        }

        let claim = ctx.claim_store(keys.name())?;
        let kv = Arc::clone(ctx.kv_store());
        let paged = match config.vector_residency {
            VectorResidency::Resident => false,
            VectorResidency::Paged => true,
            VectorResidency::Auto => kv.is_persistent(),
        };
        let storage = if paged {
            VectorStorage::Paged {
                store: Arc::clone(&kv),
                keys: keys.clone(),
                cache: ctx.cache().register(RegionKind::IndexLayer),
            }
        } else {
            VectorStorage::Resident
        };

        let index = match kv.get(keys.snapshot_key())? {
            Some(bytes) => {
                let index = HnswIndex::from_bytes(&bytes, config.dimension, storage)?;
                if index.metric() != config.metric {
                    return Err(Error::InvalidConfig(format!(
                        "snapshot uses {:?} distance but the store is configured for {:?}",
                        index.metric(),
                        config.metric
                    )));
                }
                index
            }
            None => HnswIndex::with_storage(config.metric, config.dimension, config.hnsw(), storage),
        };

        let store = Self {
            index,
            kv,
            keys,
            embedder: ctx.embedder().cloned(),
            filters: RwLock::new(FilterState::default()),
            records: ctx.cache().register(RegionKind::Metadata),
            results: ctx.cache().register(RegionKind::QueryResult),
            generation: AtomicU64::new(0),
            config,
            _claim: claim,
        };
        store.recover()?;
        Ok(store)
    }

    /// Reconciles the index with the persisted records and rebuilds the
    /// facet and graph state.
    fn recover(&self) -> Result<()> {
        let mut restored = 0usize;
        let mut reinserted = 0usize;
        let mut orphaned = 0usize;

        let mut recorded = RoaringTreemap::new();
        for key in self.kv.keys_with_prefix(self.keys.record_prefix())? {
            let Some(id) = id_from_key(&key, self.keys.record_prefix()) else {
                tracing::warn!(key = %key, "skipping malformed record key");
                continue;
            };
            let Some(attributes) = self.read_attributes(id)? else {
                continue;
            };

            if !self.index.contains(id) {
                // Inserted after the last save. Paged vectors are already in
                // the store; resident ones are lost with the process.
                let paged = if self.index.is_paged() {
                    self.kv.get(&self.keys.vector_key(id))?
                } else {
                    None
                };
                match paged {
                    Some(bytes) => {
                        let vector = vectors::decode(id, &bytes, self.config.dimension)?;
                        self.index.insert(id, vector.to_vec())?;
                        reinserted += 1;
                    }
                    None => {
                        tracing::warn!(id, "record has no vector, dropping it");
                        self.kv.delete(&key)?;
                        continue;
                    }
                }
            }

            recorded.insert(id);
            let mut filters = self.filters.write();
            filters.facets.insert(id, &attributes.facets);
            filters.graph.set_edges(id, &attributes.edges);
            restored += 1;
        }

        // Deleted after the last save.
        for id in self.index.ids() {
            if !recorded.contains(id) {
                self.index.delete(id)?;
                orphaned += 1;
            }
        }

        tracing::info!(
            store = %self.keys.name(),
            records = restored,
            reinserted,
            orphaned,
            live = self.index.len(),
            "store opened"
        );
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying index.
    pub fn index(&self) -> &HnswIndex {
        &self.index
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: VectorId) -> bool {
        self.index.contains(id)
    }

    /// Inserts a record. Fails with `DuplicateId` if `id` is live and with
    /// `DimensionMismatch` if the vector has the wrong length; neither
    /// changes the store.
    pub fn insert(&self, record: VectorRecord) -> Result<()> {
        check_dimension(&record.vector, self.config.dimension)?;
        let (id, vector, attributes) = record.into_parts();

        self.index.insert(id, vector)?;
        if let Err(e) = self.write_attributes(id, &attributes) {
            // Roll the vector back so the id stays free.
            let _ = self.index.delete(id);
            return Err(e);
        }
        self.apply_attributes(id, None, attributes);
        tracing::debug!(id, "record inserted");
        Ok(())
    }

    /// Embeds `content` with the context's provider and inserts the result.
    pub async fn insert_content(
        &self,
        id: VectorId,
        content: &str,
        attributes: RecordAttributes,
    ) -> Result<()> {
        let vector = self.embedder()?.embed(content).await?;
        self.insert(VectorRecord::from_parts(id, vector, attributes))
    }

    /// Replaces the vector of a live record. Metadata, facets and edges are
    /// unchanged.
    pub fn update_vector(&self, id: VectorId, vector: Vec<f32>) -> Result<()> {
        self.index.update(id, vector)?;
        self.invalidate_results();
        tracing::debug!(id, "record vector updated");
        Ok(())
    }

    /// Replaces the metadata, facets and edges of a live record.
    ///
    /// The new attributes are persisted first; if that fails the record
    /// keeps its old attributes everywhere.
    pub fn update_attributes(&self, id: VectorId, attributes: RecordAttributes) -> Result<()> {
        if !self.index.contains(id) {
            return Err(Error::NotFound(id));
        }
        let previous = self.load_attributes(id)?;
        self.write_attributes(id, &attributes)?;
        self.apply_attributes(id, previous.as_deref(), attributes);
        tracing::debug!(id, "record attributes updated");
        Ok(())
    }

    /// Deletes a record. Unknown or already deleted ids are `NotFound`.
    ///
    /// Compacts the index when the tombstone ratio reaches
    /// `compaction_ratio`.
    pub fn delete(&self, id: VectorId) -> Result<()> {
        self.index.delete(id)?;
        let attributes = self.load_attributes(id)?;
        self.kv.delete(&self.keys.record_key(id))?;
        {
            let mut filters = self.filters.write();
            if let Some(attributes) = &attributes {
                filters.facets.remove(id, &attributes.facets);
            }
            filters.graph.remove(id);
        }
        self.records.remove(&id);
        self.invalidate_results();
        tracing::debug!(id, "record deleted");

        let ratio = self.index.tombstone_ratio();
        if ratio >= self.config.compaction_ratio {
            tracing::info!(ratio, threshold = self.config.compaction_ratio, "compacting after delete");
            self.compact()?;
        }
        Ok(())
    }

    /// Returns the record with its current vector, or `None` if `id` is not
    /// live.
    pub fn get(&self, id: VectorId) -> Result<Option<VectorRecord>> {
        if !self.index.contains(id) {
            return Ok(None);
        }
        let Some(vector) = self.index.get(id)? else {
            return Ok(None);
        };
        let attributes = self.load_attributes(id)?.unwrap_or_default();
        Ok(Some(VectorRecord::from_parts(
            id,
            vector.to_vec(),
            (*attributes).clone(),
        )))
    }

    /// Removes tombstoned nodes from the index. Returns how many.
    pub fn compact(&self) -> Result<usize> {
        let removed = self.index.compact()?;
        self.invalidate_results();
        Ok(removed)
    }

    /// Writes the index snapshot and flushes the key-value store.
    pub fn save(&self) -> Result<()> {
        let bytes = self.index.to_bytes()?;
        self.kv.put(self.keys.snapshot_key(), &bytes)?;
        self.kv.flush()?;
        tracing::info!(
            store = %self.keys.name(),
            bytes = bytes.len(),
            live = self.index.len(),
            "store saved"
        );
        Ok(())
    }

    /// Searches with a ready vector.
    ///
    /// Results are ordered by distance, ties by id, and carry the record
    /// metadata. Fails with `NotFound` if the graph anchor is not a live
    /// record.
    pub fn query_vector(
        &self,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<QueryHit>> {
        self.query_vector_with(vector, k, filter, None)
    }

    /// Like [`query_vector`](Self::query_vector) with an explicit starting
    /// beam width for the index search. `None` uses `ef_search`. The beam
    /// never starts below the oversampled candidate count.
    pub fn query_vector_with(
        &self,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
        ef: Option<usize>,
    ) -> Result<Vec<QueryHit>> {
        check_dimension(vector, self.config.dimension)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let key = QueryKey::new(vector, k, ef, filter);
        let slot = key.fingerprint();
        if let Some(cached) = self.results.get(&slot) {
            if cached.key == key {
                return Ok(cached.hits.clone());
            }
        }
        let generation = self.generation.load(AtomicOrdering::Acquire);

        let allowed = self.allowed_ids(filter)?;
        let ranked = match &allowed {
            Some(set) if set.is_empty() => Vec::new(),
            Some(set) if set.len() <= self.config.exact_scan_threshold as u64 => {
                self.index.rank_exact(vector, set.iter(), k)?
            }
            _ => self.search_widening(vector, k, ef, allowed.as_ref())?,
        };
        let hits = self.hydrate(ranked)?;

        if self.generation.load(AtomicOrdering::Acquire) == generation {
            let cached = Arc::new(CachedQuery {
                key,
                hits: hits.clone(),
            });
            self.results.insert(slot, cached);
            if self.generation.load(AtomicOrdering::Acquire) != generation {
                self.results.remove(&slot);
            }
        }
        Ok(hits)
    }

    /// Searches with a vector or with content embedded on the fly.
    pub async fn query(
        &self,
        input: QueryInput,
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<QueryHit>> {
        let vector = match input {
            QueryInput::Vector(vector) => vector,
            QueryInput::Content(content) => self.embedder()?.embed(&content).await?,
        };
        self.query_vector(&vector, k, filter)
    }

    fn embedder(&self) -> Result<&Arc<EmbeddingProvider>> {
        self.embedder.as_ref().ok_or_else(|| {
            Error::InvalidConfig("no embedding provider in the engine context".to_string())
        })
    }

    /// Ids the filter permits, or `None` for no restriction.
    fn allowed_ids(&self, filter: &QueryFilter) -> Result<Option<RoaringTreemap>> {
        if let Some(graph) = &filter.graph {
            if !self.index.contains(graph.anchor) {
                return Err(Error::NotFound(graph.anchor));
            }
        }

        let filters = self.filters.read();
        let mut allowed = filters.facets.matching(&filter.facets);
        if let Some(graph) = &filter.graph {
            let reachable = filters.graph.reachable(
                graph.anchor,
                graph.max_hops,
                graph.direction,
                graph.include_anchor,
            );
            allowed = Some(match allowed {
                Some(facets) => facets & reachable,
                None => reachable,
            });
        }
        Ok(allowed)
    }

    /// Oversampled search that doubles the candidate count and beam while
    /// fewer than `k` candidates pass the filter.
    fn search_widening(
        &self,
        vector: &[f32],
        k: usize,
        ef: Option<usize>,
        allowed: Option<&RoaringTreemap>,
    ) -> Result<Vec<SearchResult>> {
        let mut candidates = k.saturating_mul(self.config.oversample);
        let mut ef = ef.unwrap_or(self.config.ef_search).max(candidates);

        let mut round = 0;
        loop {
            let hits = self
                .index
                .search_with(vector, &SearchOptions::new(candidates).with_ef(ef))?
                .hits;
            let exhausted = hits.len() < candidates;

            let mut survivors: Vec<SearchResult> = hits
                .into_iter()
                .filter(|hit| allowed.map_or(true, |set| set.contains(hit.id)))
                .collect();

            if survivors.len() >= k || exhausted || round >= self.config.max_expansion_rounds {
                survivors.truncate(k);
                return Ok(survivors);
            }

            round += 1;
            candidates = candidates.saturating_mul(2);
            ef = ef.saturating_mul(2);
            tracing::debug!(
                round,
                survivors = survivors.len(),
                candidates,
                ef,
                "widening filtered query"
            );
        }
    }

    /// Attaches metadata. Records deleted since ranking are dropped.
    fn hydrate(&self, ranked: Vec<SearchResult>) -> Result<Vec<QueryHit>> {
        let mut hits = Vec::with_capacity(ranked.len());
        for result in ranked {
            let Some(attributes) = self.load_attributes(result.id)? else {
                continue;
            };
            hits.push(QueryHit {
                id: result.id,
                distance: result.distance,
                metadata: attributes.metadata.clone(),
            });
        }
        Ok(hits)
    }

    /// Reads record attributes through the metadata region.
    fn load_attributes(&self, id: VectorId) -> Result<Option<Arc<RecordAttributes>>> {
        if let Some(cached) = self.records.get(&id) {
            return Ok(Some(cached));
        }
        let Some(attributes) = self.read_attributes(id)? else {
            return Ok(None);
        };
        let attributes = Arc::new(attributes);
        self.records.insert(id, Arc::clone(&attributes));
        Ok(Some(attributes))
    }

    fn read_attributes(&self, id: VectorId) -> Result<Option<RecordAttributes>> {
        match self.kv.get(&self.keys.record_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_attributes(&self, id: VectorId, attributes: &RecordAttributes) -> Result<()> {
        let bytes = serde_json::to_vec(attributes)?;
        self.kv.put(&self.keys.record_key(id), &bytes)
    }

    /// Swaps `previous` for `attributes` in the filters and the record cache.
    fn apply_attributes(
        &self,
        id: VectorId,
        previous: Option<&RecordAttributes>,
        attributes: RecordAttributes,
    ) {
        {
            let mut filters = self.filters.write();
            if let Some(previous) = previous {
                filters.facets.remove(id, &previous.facets);
            }
            filters.facets.insert(id, &attributes.facets);
            filters.graph.set_edges(id, &attributes.edges);
        }
        self.records.insert(id, Arc::new(attributes));
        self.invalidate_results();
    }

    fn invalidate_results(&self) {
        self.generation.fetch_add(1, AtomicOrdering::AcqRel);
        self.results.clear();
    }
}

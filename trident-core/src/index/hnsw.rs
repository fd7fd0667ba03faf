//! HNSW (Hierarchical Navigable Small World) index implementation.
//!
//! HNSW is a graph-based approximate nearest neighbor algorithm that provides
//! excellent search performance with high recall.
//!
//! # Algorithm Overview
//!
//! - Multi-layer graph where each layer is a navigable small world graph
//! - Upper layers have fewer nodes (exponentially decreasing)
//! - Search starts from top layer and greedily descends
//! - Each layer narrows down the search region
//!
//! # Concurrency
//!
//! The index is shared by reference across threads. Nodes live in a
//! concurrent map and each node guards its own neighbor lists, so inserts
//! and searches proceed in parallel. No code path holds two node locks at
//! once, and map references are never held across another lock: handles are
//! cloned out first. Writers share a structure lock that compaction takes
//! exclusively; searches never take it.
//!
//! # Deletion
//!
//! Deletes only mark a node as tombstoned. Tombstoned nodes keep routing
//! searches but are never returned. [`HnswIndex::compact`] removes them and
//! repairs the lists that pointed at them.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::index::node::{Node, NodeState};
use crate::index::vectors::{VectorStorage, VectorTable};
use crate::vector::{check_dimension, SharedVector, Vector, VectorId};

/// Levels above this are clamped.
const MAX_LEVEL: usize = 16;

/// Searches retry this often when compaction swaps the entry point under
/// them.
const ENTRY_RETRIES: usize = 3;

/// Configuration for HNSW index.
#[derive(Debug, Clone, PartialEq)]
pub struct HnswConfig {
    /// Maximum number of connections per node (except layer 0).
    /// Higher = better recall, more memory. Typical: 16-64.
    pub m: usize,
    /// Maximum connections at layer 0 (usually 2*M).
    pub m_max0: usize,
    /// Beam width during construction. Higher = better graph quality, slower build.
    /// Typical: 100-200.
    pub ef_construction: usize,
    /// Default beam width during search. Can be overridden per-query.
    /// Typical: 50-200.
    pub ef_search: usize,
    /// Level generation multiplier, usually 1/ln(M).
    pub level_multiplier: f64,
    /// Seed for level assignment. Same seed and insert order, same graph.
    pub seed: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self::with_m(16)
    }
}

impl HnswConfig {
    pub const DEFAULT_SEED: u64 = 0x7472_6964_656e_7431;

    /// Creates config with specified M parameter.
    pub fn with_m(m: usize) -> Self {
        Self {
            m,
            m_max0: m * 2,
            ef_construction: 100,
            ef_search: 50,
            level_multiplier: Self::default_level_multiplier(m),
            seed: Self::DEFAULT_SEED,
        }
    }

    /// `1 / ln(m)`, the multiplier that makes each layer about `m` times
    /// smaller than the one below.
    pub fn default_level_multiplier(m: usize) -> f64 {
        1.0 / (m.max(2) as f64).ln()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(Error::InvalidConfig(format!("m must be at least 2, got {}", self.m)));
        }
        if self.m_max0 < self.m {
            return Err(Error::InvalidConfig(format!(
                "m_max0 ({}) must be at least m ({})",
                self.m_max0, self.m
            )));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(Error::InvalidConfig("ef values must be positive".into()));
        }
        if !(self.level_multiplier.is_finite() && self.level_multiplier > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "level_multiplier must be positive, got {}",
                self.level_multiplier
            )));
        }
        Ok(())
    }
}

/// A candidate during search, ordered by distance (min-heap).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub(crate) id: VectorId,
    pub(crate) distance: f32,
}

impl Candidate {
    /// Ascending distance, ties broken by lower id.
    fn closer(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.closer(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (lower distance = higher priority)
        other.closer(self)
    }
}

/// A candidate for max-heap (furthest first).
#[derive(Debug, Clone, Copy)]
struct FurthestCandidate(Candidate);

impl PartialEq for FurthestCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for FurthestCandidate {}

impl PartialOrd for FurthestCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FurthestCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Normal order for max-heap (higher distance = higher priority)
        self.0.closer(&other.0)
    }
}

/// Search result from HNSW.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    /// Vector ID.
    pub id: VectorId,
    /// Distance from query.
    pub distance: f32,
}

impl From<Candidate> for SearchResult {
    fn from(c: Candidate) -> Self {
        Self {
            id: c.id,
            distance: c.distance,
        }
    }
}

/// Shared flag a caller can set to stop running searches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }
}

/// Per-query parameters for [`HnswIndex::search_with`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub k: usize,
    /// Beam width; `None` uses the index's `ef_search`. Never below `k`.
    pub ef: Option<usize>,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelFlag>,
}

impl SearchOptions {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            ef: None,
            deadline: None,
            cancel: None,
        }
    }

    pub fn with_ef(mut self, ef: usize) -> Self {
        self.ef = Some(ef);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn expired(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Hits of a search, plus whether it stopped early.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutcome {
    pub hits: Vec<SearchResult>,
    /// True if a deadline or cancellation cut the beam short. The hits are
    /// the best found so far.
    pub truncated: bool,
}

/// Top of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryPoint {
    pub(crate) id: VectorId,
    pub(crate) level: usize,
}

/// Which nodes a layer search may put into its result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admit {
    /// Query results: live nodes only.
    Live,
    /// Graph construction: anything still in the graph.
    Linked,
}

struct LayerSearch {
    found: Vec<Candidate>,
    truncated: bool,
}

/// HNSW index for approximate nearest neighbor search.
///
/// # Example
///
/// ```
/// use trident_core::{DistanceMetric, HnswConfig, HnswIndex};
///
/// let index = HnswIndex::new(DistanceMetric::Cosine, 3, HnswConfig::default());
///
/// // Insert vectors
/// index.insert(1, vec![1.0, 0.0, 0.0]).unwrap();
/// index.insert(2, vec![0.9, 0.1, 0.0]).unwrap();
/// index.insert(3, vec![0.0, 1.0, 0.0]).unwrap();
///
/// // Search
/// let results = index.search(&[1.0, 0.0, 0.0], 2, None).unwrap();
/// assert_eq!(results[0].id, 1); // Exact match
/// ```
pub struct HnswIndex {
    pub(super) dimension: usize,
    pub(super) metric: DistanceMetric,
    pub(super) config: HnswConfig,
    pub(super) nodes: DashMap<VectorId, Arc<Node>>,
    pub(super) vectors: VectorTable,
    pub(super) entry: RwLock<Option<EntryPoint>>,
    /// Shared by writers, exclusive for compaction and snapshots.
    pub(super) structure: RwLock<()>,
    rng: Mutex<StdRng>,
    pub(super) live: AtomicUsize,
    pub(super) tombstoned: AtomicUsize,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("metric", &self.metric)
            .field("live", &self.len())
            .field("tombstones", &self.tombstones())
            .finish()
    }
}

impl HnswIndex {
    /// Creates a new empty HNSW index with resident vectors.
    pub fn new(metric: DistanceMetric, dimension: usize, config: HnswConfig) -> Self {
        Self::with_storage(metric, dimension, config, VectorStorage::Resident)
    }

    /// Creates a new empty HNSW index keeping vectors in `storage`.
    pub fn with_storage(
        metric: DistanceMetric,
        dimension: usize,
        config: HnswConfig,
        storage: VectorStorage,
    ) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            dimension,
            metric,
            config,
            nodes: DashMap::new(),
            vectors: VectorTable::new(storage, dimension),
            entry: RwLock::new(None),
            structure: RwLock::new(()),
            rng: Mutex::new(rng),
            live: AtomicUsize::new(0),
            tombstoned: AtomicUsize::new(0),
        }
    }

    /// Returns the number of live vectors in the index.
    #[inline]
    pub fn len(&self) -> usize {
        self.live.load(AtomicOrdering::Acquire)
    }

    /// Returns true if the index has no live vectors.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of deleted nodes awaiting compaction.
    pub fn tombstones(&self) -> usize {
        self.tombstoned.load(AtomicOrdering::Acquire)
    }

    /// Share of graph nodes that are tombstoned.
    pub fn tombstone_ratio(&self) -> f64 {
        let dead = self.tombstones();
        let total = dead + self.len();
        if total == 0 {
            0.0
        } else {
            dead as f64 / total as f64
        }
    }

    /// Returns the dimension of vectors in this index.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Returns the distance metric.
    #[inline]
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// Whether vectors are paged through the key-value store.
    pub fn is_paged(&self) -> bool {
        self.vectors.is_paged()
    }

    /// True if `id` is live.
    pub fn contains(&self, id: VectorId) -> bool {
        self.node(id).is_some_and(|n| n.is_live())
    }

    /// Returns the vector of a live node.
    pub fn get(&self, id: VectorId) -> Result<Option<SharedVector>> {
        if !self.contains(id) {
            return Ok(None);
        }
        self.vectors.get(id)
    }

    /// Ids of all live nodes, ascending.
    pub fn ids(&self) -> Vec<VectorId> {
        let mut ids: Vec<VectorId> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().is_live())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Lifecycle state of a node still in the graph.
    pub fn state(&self, id: VectorId) -> Option<NodeState> {
        self.node(id).map(|n| n.state())
    }

    /// Assigned level of a node still in the graph.
    pub fn level(&self, id: VectorId) -> Option<usize> {
        self.node(id).map(|n| n.level)
    }

    /// Neighbor list of a node at `layer`.
    pub fn neighbors(&self, id: VectorId, layer: usize) -> Option<Vec<VectorId>> {
        let node = self.node(id)?;
        (layer <= node.level).then(|| node.neighbors(layer))
    }

    /// Level of the current entry point, `None` for an empty graph.
    pub fn top_level(&self) -> Option<usize> {
        let entry = *self.entry.read();
        entry.map(|e| e.level)
    }

    /// Neighbor bound for `layer`.
    #[inline]
    pub fn layer_bound(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m_max0
        } else {
            self.config.m
        }
    }

    /// Clones the node handle out of the map so no map lock outlives this call.
    #[inline]
    pub(super) fn node(&self, id: VectorId) -> Option<Arc<Node>> {
        self.nodes.get(&id).map(|n| Arc::clone(n.value()))
    }

    /// Assigns a random level for a new node.
    fn random_level(&self) -> usize {
        let r: f64 = self.rng.lock().gen();
        // 1 - r lies in (0, 1], so the logarithm is finite.
        let level = (-(1.0 - r).ln() * self.config.level_multiplier).floor();
        (level as usize).min(MAX_LEVEL)
    }

    /// Distance from `query` to a stored node; `None` if it has no payload.
    fn distance_to(&self, query: &[f32], id: VectorId) -> Result<Option<f32>> {
        Ok(self
            .vectors
            .get(id)?
            .map(|v| self.metric.compute(query, &v)))
    }

    /// Inserts a vector into the index.
    ///
    /// Fails with `DimensionMismatch` before touching anything if the vector
    /// has the wrong length, and with `DuplicateId` if `id` is live. A
    /// tombstoned id that has not been compacted yet is revived with the
    /// new vector.
    pub fn insert<V: Into<Vector>>(&self, id: VectorId, vector: V) -> Result<()> {
        let vector = vector.into();
        vector.check(self.dimension)?;
        let vector = vector.into_shared();

        let _structure = self.structure.read();
        let level = self.random_level();

        let node = match self.nodes.entry(id) {
            Entry::Occupied(existing) => {
                let node = Arc::clone(existing.get());
                drop(existing);
                return self.revive(node, vector);
            }
            Entry::Vacant(slot) => {
                let node = Arc::new(Node::new(id, level));
                slot.insert(Arc::clone(&node));
                node
            }
        };

        if let Err(e) = self.vectors.put(id, Arc::clone(&vector)) {
            self.nodes.remove(&id);
            return Err(e);
        }
        self.live.fetch_add(1, AtomicOrdering::AcqRel);

        self.connect(&node, &vector)
    }

    fn revive(&self, node: Arc<Node>, vector: SharedVector) -> Result<()> {
        {
            // The write lock serializes writers on this node.
            let _links = node.links.write();
            match node.state() {
                NodeState::Live => return Err(Error::DuplicateId(node.id)),
                NodeState::Compacted => return Err(Error::NotFound(node.id)),
                NodeState::Tombstoned => {
                    self.vectors.put(node.id, Arc::clone(&vector))?;
                    node.set_state(NodeState::Live);
                }
            }
        }
        self.tombstoned.fetch_sub(1, AtomicOrdering::AcqRel);
        self.live.fetch_add(1, AtomicOrdering::AcqRel);
        tracing::debug!(id = node.id, "revived tombstoned node");

        self.connect(&node, &vector)
    }

    /// Replaces the vector of a live node and relinks it in place.
    pub fn update<V: Into<Vector>>(&self, id: VectorId, vector: V) -> Result<()> {
        let vector = vector.into();
        vector.check(self.dimension)?;
        let vector = vector.into_shared();

        let _structure = self.structure.read();
        let node = self.node(id).ok_or(Error::NotFound(id))?;
        {
            let _links = node.links.write();
            if !node.is_live() {
                return Err(Error::NotFound(id));
            }
            self.vectors.put(id, Arc::clone(&vector))?;
        }

        self.connect(&node, &vector)
    }

    /// Marks a live node as deleted.
    pub fn delete(&self, id: VectorId) -> Result<()> {
        let _structure = self.structure.read();
        let node = self.node(id).ok_or(Error::NotFound(id))?;
        if !node.transition(NodeState::Live, NodeState::Tombstoned) {
            return Err(Error::NotFound(id));
        }
        self.live.fetch_sub(1, AtomicOrdering::AcqRel);
        self.tombstoned.fetch_add(1, AtomicOrdering::AcqRel);
        Ok(())
    }

    /// Links `node` into every layer up to its level.
    fn connect(&self, node: &Arc<Node>, query: &[f32]) -> Result<()> {
        let current = *self.entry.read();
        let entry = match current {
            Some(entry) => entry,
            None => {
                let mut guard = self.entry.write();
                match *guard {
                    Some(entry) => entry,
                    None => {
                        *guard = Some(EntryPoint {
                            id: node.id,
                            level: node.level,
                        });
                        return Ok(());
                    }
                }
            }
        };

        let Some(start) = self.distance_to(query, entry.id)? else {
            return Err(Error::IndexCorrupt(format!(
                "entry point {} has no vector",
                entry.id
            )));
        };
        let mut current = Candidate {
            id: entry.id,
            distance: start,
        };

        // Phase 1: Greedily traverse from top to new node's level + 1
        for layer in (node.level + 1..=entry.level).rev() {
            current = self.greedy_closest(query, current, layer)?;
        }

        // Phase 2: Search and connect at each layer from new_level down to 0
        let mut entry_points = vec![current];
        let unbounded = SearchOptions::new(0);
        for layer in (0..=node.level.min(entry.level)).rev() {
            let search = self.search_layer(
                query,
                &entry_points,
                self.config.ef_construction,
                layer,
                Admit::Linked,
                &unbounded,
            )?;
            let candidates: Vec<Candidate> = search
                .found
                .into_iter()
                .filter(|c| c.id != node.id)
                .collect();

            let selected = self.select_neighbors(&candidates, self.layer_bound(layer))?;
            node.set_neighbors(layer, selected.clone());

            // Connect neighbors back to new node (bidirectional)
            for neighbor in selected {
                self.add_link(neighbor, node.id, layer)?;
            }

            if !candidates.is_empty() {
                entry_points = candidates;
            }
        }

        if node.level > entry.level {
            let mut guard = self.entry.write();
            if guard.map_or(true, |e| node.level > e.level) {
                *guard = Some(EntryPoint {
                    id: node.id,
                    level: node.level,
                });
                tracing::debug!(id = node.id, level = node.level, "promoted entry point");
            }
        }

        Ok(())
    }

    /// Adds `new_id` to the list of `owner` at `layer`, re-pruning the list
    /// with the diversity heuristic if it overflows.
    fn add_link(&self, owner: VectorId, new_id: VectorId, layer: usize) -> Result<()> {
        let Some(node) = self.node(owner) else {
            return Ok(());
        };
        let owner_vector = self.vectors.get(owner)?;
        let bound = self.layer_bound(layer);

        let mut links = node.links.write();
        let Some(list) = links.get_mut(layer) else {
            return Ok(());
        };
        if list.contains(&new_id) {
            return Ok(());
        }
        list.push(new_id);
        if list.len() <= bound {
            return Ok(());
        }

        let Some(owner_vector) = owner_vector else {
            list.truncate(bound);
            return Ok(());
        };
        let mut candidates = Vec::with_capacity(list.len());
        for &id in list.iter() {
            if let Some(distance) = self.distance_to(&owner_vector, id)? {
                candidates.push(Candidate { id, distance });
            }
        }
        candidates.sort_by(Candidate::closer);
        *list = self.select_neighbors(&candidates, bound)?;
        Ok(())
    }

    /// Diversity heuristic. `candidates` must be sorted by ascending
    /// distance to the node being linked. A candidate is accepted unless an
    /// already accepted neighbor is closer to it than the node is, so the
    /// nearest candidate is always kept.
    fn select_neighbors(&self, candidates: &[Candidate], bound: usize) -> Result<Vec<VectorId>> {
        let mut selected: Vec<(VectorId, SharedVector)> = Vec::with_capacity(bound);
        for candidate in candidates {
            if selected.len() >= bound {
                break;
            }
            let Some(vector) = self.vectors.get(candidate.id)? else {
                continue;
            };
            let diverse = selected
                .iter()
                .all(|(_, kept)| self.metric.compute(&vector, kept) >= candidate.distance);
            if diverse {
                selected.push((candidate.id, vector));
            }
        }
        Ok(selected.into_iter().map(|(id, _)| id).collect())
    }

    /// Greedy search for a single nearest neighbor at a layer.
    fn greedy_closest(&self, query: &[f32], start: Candidate, layer: usize) -> Result<Candidate> {
        let mut current = start;

        loop {
            let mut changed = false;
            let Some(node) = self.node(current.id) else {
                break;
            };

            for neighbor in node.neighbors(layer) {
                if let Some(distance) = self.distance_to(query, neighbor)? {
                    let candidate = Candidate {
                        id: neighbor,
                        distance,
                    };
                    if candidate.closer(&current) == Ordering::Less {
                        current = candidate;
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        Ok(current)
    }

    fn admissible(&self, id: VectorId, admit: Admit) -> Option<bool> {
        let node = self.node(id)?;
        Some(match (admit, node.state()) {
            (_, NodeState::Compacted) => false,
            (Admit::Live, state) => state == NodeState::Live,
            (Admit::Linked, _) => true,
        })
    }

    /// Beam search over one layer with `ef` result slots.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[Candidate],
        ef: usize,
        layer: usize,
        admit: Admit,
        limits: &SearchOptions,
    ) -> Result<LayerSearch> {
        let mut visited: HashSet<VectorId> = HashSet::new();
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::new(); // min-heap (closest first)
        let mut results: BinaryHeap<FurthestCandidate> = BinaryHeap::new(); // max-heap (furthest first)
        let mut truncated = false;

        // Initialize with entry points
        for &ep in entry_points {
            if visited.insert(ep.id) {
                candidates.push(ep);
                if self.admissible(ep.id, admit) == Some(true) {
                    results.push(FurthestCandidate(ep));
                }
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(closest) = candidates.pop() {
            if limits.expired() {
                truncated = true;
                break;
            }

            // Stop if closest candidate is further than worst result
            if let Some(furthest) = results.peek() {
                if results.len() >= ef && closest.closer(&furthest.0) == Ordering::Greater {
                    break;
                }
            }

            let Some(node) = self.node(closest.id) else {
                continue;
            };

            for neighbor in node.neighbors(layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let Some(admissible) = self.admissible(neighbor, admit) else {
                    continue;
                };
                let Some(distance) = self.distance_to(query, neighbor)? else {
                    continue;
                };

                let candidate = Candidate {
                    id: neighbor,
                    distance,
                };
                let should_add = results.len() < ef
                    || results
                        .peek()
                        .is_some_and(|f| candidate.closer(&f.0) == Ordering::Less);

                if should_add {
                    candidates.push(candidate);
                    if admissible {
                        results.push(FurthestCandidate(candidate));
                        // Keep only ef best
                        while results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        // Convert to sorted vector
        let mut found: Vec<Candidate> = results.into_iter().map(|f| f.0).collect();
        found.sort_by(Candidate::closer);
        Ok(LayerSearch { found, truncated })
    }

    /// Searches for the k nearest live neighbors.
    ///
    /// `ef` defaults to the configured `ef_search` and is raised to `k`.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<SearchResult>> {
        let mut options = SearchOptions::new(k);
        options.ef = ef;
        Ok(self.search_with(query, &options)?.hits)
    }

    /// Searches with a deadline and/or cancel flag.
    ///
    /// When either fires the beam stops and the best hits found so far are
    /// returned with `truncated` set.
    pub fn search_with(&self, query: &[f32], options: &SearchOptions) -> Result<SearchOutcome> {
        check_dimension(query, self.dimension)?;
        if options.k == 0 {
            return Ok(SearchOutcome::default());
        }
        let ef = options.ef.unwrap_or(self.config.ef_search).max(options.k);

        for _ in 0..ENTRY_RETRIES {
            let current = *self.entry.read();
            let Some(entry) = current else {
                return Ok(SearchOutcome::default());
            };
            // Compaction may have removed the entry point after we read it.
            let Some(distance) = self.distance_to(query, entry.id)? else {
                continue;
            };

            // Phase 1: Greedy descent from top to layer 1
            let mut current = Candidate {
                id: entry.id,
                distance,
            };
            for layer in (1..=entry.level).rev() {
                current = self.greedy_closest(query, current, layer)?;
            }

            // Phase 2: Search layer 0 with ef candidates
            let layer0 = self.search_layer(query, &[current], ef, 0, Admit::Live, options)?;
            let hits = layer0
                .found
                .into_iter()
                .take(options.k)
                .map(SearchResult::from)
                .collect();

            return Ok(SearchOutcome {
                hits,
                truncated: layer0.truncated,
            });
        }

        Ok(SearchOutcome::default())
    }

    /// Ranks the given ids exactly against `query`, skipping ids that are
    /// not live. Used when a filter leaves few enough ids to scan.
    pub fn rank_exact<I>(&self, query: &[f32], ids: I, k: usize) -> Result<Vec<SearchResult>>
    where
        I: IntoIterator<Item = VectorId>,
    {
        check_dimension(query, self.dimension)?;
        let mut ranked = Vec::new();
        for id in ids {
            if !self.contains(id) {
                continue;
            }
            if let Some(distance) = self.distance_to(query, id)? {
                ranked.push(Candidate { id, distance });
            }
        }
        ranked.sort_by(Candidate::closer);
        Ok(ranked.into_iter().take(k).map(SearchResult::from).collect())
    }

    /// Removes all tombstoned nodes and repairs the graph around them.
    ///
    /// Blocks writers for its duration; searches keep running and may see
    /// the graph before or after each list repair. Returns the number of
    /// nodes removed.
    pub fn compact(&self) -> Result<usize> {
        let _structure = self.structure.write();

        let doomed: HashSet<VectorId> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().state() == NodeState::Tombstoned)
            .map(|entry| *entry.key())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let survivors: Vec<Arc<Node>> = self
            .nodes
            .iter()
            .filter(|entry| !doomed.contains(entry.key()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut repaired = 0usize;
        for node in &survivors {
            repaired += self.repair_links(node, &doomed)?;
        }

        // Re-elect the entry point among survivors: highest level, lowest id.
        let elected = survivors
            .iter()
            .max_by(|a, b| a.level.cmp(&b.level).then_with(|| b.id.cmp(&a.id)))
            .map(|n| EntryPoint {
                id: n.id,
                level: n.level,
            });
        *self.entry.write() = elected;

        for &id in &doomed {
            if let Some((_, node)) = self.nodes.remove(&id) {
                node.set_state(NodeState::Compacted);
            }
            self.vectors.remove(id)?;
        }
        self.tombstoned.fetch_sub(doomed.len(), AtomicOrdering::AcqRel);

        tracing::info!(
            removed = doomed.len(),
            repaired_lists = repaired,
            remaining = survivors.len(),
            "compacted index"
        );
        Ok(doomed.len())
    }

    /// Replaces every reference to a doomed node in `node`'s lists. The
    /// replacement pool is the surviving neighbors plus the survivors
    /// reachable through the doomed neighbors. Returns the number of lists
    /// rewritten.
    fn repair_links(&self, node: &Arc<Node>, doomed: &HashSet<VectorId>) -> Result<usize> {
        let links = node.links.read().clone();
        if !links.iter().flatten().any(|id| doomed.contains(id)) {
            return Ok(0);
        }
        let Some(own) = self.vectors.get(node.id)? else {
            return Ok(0);
        };

        let mut rewritten = 0;
        for (layer, list) in links.iter().enumerate() {
            if !list.iter().any(|id| doomed.contains(id)) {
                continue;
            }

            let mut pool: HashSet<VectorId> = HashSet::new();
            let mut seen: HashSet<VectorId> = HashSet::new();
            let mut queue: VecDeque<VectorId> = VecDeque::new();
            for &id in list {
                if doomed.contains(&id) {
                    if seen.insert(id) {
                        queue.push_back(id);
                    }
                } else {
                    pool.insert(id);
                }
            }
            // Walk through doomed nodes until enough survivors are found.
            while let Some(dead) = queue.pop_front() {
                if pool.len() >= self.config.ef_construction {
                    break;
                }
                let Some(dead_node) = self.node(dead) else {
                    continue;
                };
                for id in dead_node.neighbors(layer) {
                    if id == node.id {
                        continue;
                    }
                    if doomed.contains(&id) {
                        if seen.insert(id) {
                            queue.push_back(id);
                        }
                    } else {
                        pool.insert(id);
                    }
                }
            }

            let mut candidates = Vec::with_capacity(pool.len());
            for id in pool {
                if let Some(distance) = self.distance_to(&own, id)? {
                    candidates.push(Candidate { id, distance });
                }
            }
            candidates.sort_by(Candidate::closer);
            let selected = self.select_neighbors(&candidates, self.layer_bound(layer))?;
            node.set_neighbors(layer, selected);
            rewritten += 1;
        }
        Ok(rewritten)
    }

    /// Restores a node while loading a snapshot.
    pub(super) fn restore_node(&self, node: Node) {
        match node.state() {
            NodeState::Live => self.live.fetch_add(1, AtomicOrdering::AcqRel),
            _ => self.tombstoned.fetch_add(1, AtomicOrdering::AcqRel),
        };
        self.nodes.insert(node.id, Arc::new(node));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn create_test_index() -> HnswIndex {
        let index = HnswIndex::new(DistanceMetric::Euclidean, 3, HnswConfig::with_m(4));

        // Insert some test vectors
        index.insert(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(2, vec![0.0, 1.0, 0.0]).unwrap();
        index.insert(3, vec![0.0, 0.0, 1.0]).unwrap();
        index.insert(4, vec![1.0, 1.0, 0.0]).unwrap();
        index.insert(5, vec![1.0, 0.0, 1.0]).unwrap();

        index
    }

    fn pseudo_random_vectors(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect()
    }

    #[test]
    fn test_new_index() {
        let index = HnswIndex::new(DistanceMetric::Cosine, 128, HnswConfig::default());
        assert!(index.is_empty());
        assert_eq!(index.dimension(), 128);
        assert_eq!(index.top_level(), None);
    }

    #[test]
    fn test_insert_single() {
        let index = HnswIndex::new(DistanceMetric::Euclidean, 3, HnswConfig::default());
        index.insert(1, vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.entry.read().is_some());
    }

    #[test]
    fn test_insert_duplicate() {
        let index = create_test_index();
        let result = index.insert(1, vec![0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(Error::DuplicateId(1))));
        // The original vector is untouched.
        assert_eq!(index.get(1).unwrap().as_deref(), Some(&[1.0, 0.0, 0.0][..]));
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let index = HnswIndex::new(DistanceMetric::Euclidean, 3, HnswConfig::default());
        let result = index.insert(1, vec![1.0, 2.0]);
        assert!(matches!(
            result,
            Err(Error::DimensionMismatch {
                expected: 3,
                got: 2
            })
        ));
        assert!(index.is_empty());
        assert!(index.nodes.is_empty());
    }

    #[test]
    fn test_search_exact_match() {
        let index = create_test_index();

        let results = index.search(&[1.0, 0.0, 0.0], 1, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
        assert!(results[0].distance < 1e-6);
    }

    #[test]
    fn test_search_k_results() {
        let index = create_test_index();

        let results = index.search(&[1.0, 0.0, 0.0], 3, None).unwrap();
        assert_eq!(results.len(), 3);

        // Results should be sorted by distance
        for i in 1..results.len() {
            assert!(results[i - 1].distance <= results[i].distance);
        }
    }

    #[test]
    fn test_search_ties_broken_by_id() {
        let index = HnswIndex::new(DistanceMetric::Euclidean, 2, HnswConfig::with_m(4));
        index.insert(9, vec![0.0, 1.0]).unwrap();
        index.insert(3, vec![1.0, 0.0]).unwrap();
        index.insert(5, vec![0.0, -1.0]).unwrap();

        let results = index.search(&[0.0, 0.0], 3, None).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 5, 9]);
    }

    #[test]
    fn test_ties_resolved_with_narrow_beam() {
        let index = HnswIndex::new(DistanceMetric::Euclidean, 2, HnswConfig::with_m(4));
        index.insert(9, vec![0.0, 1.0]).unwrap();
        index.insert(3, vec![1.0, 0.0]).unwrap();

        // A single slot still prefers the lower id among equals.
        let results = index.search(&[0.0, 0.0], 1, Some(1)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 3);
    }

    #[test]
    fn test_search_empty_index() {
        let index = HnswIndex::new(DistanceMetric::Euclidean, 3, HnswConfig::default());
        let results = index.search(&[1.0, 0.0, 0.0], 10, None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let index = create_test_index();
        assert!(matches!(
            index.search(&[1.0, 0.0], 1, None),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_get() {
        let index = create_test_index();
        assert_eq!(index.get(1).unwrap().as_deref(), Some(&[1.0, 0.0, 0.0][..]));
        assert!(index.get(999).unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let index = create_test_index();
        assert_eq!(index.len(), 5);

        index.delete(1).unwrap();
        assert_eq!(index.len(), 4);
        assert_eq!(index.tombstones(), 1);
        assert!(index.get(1).unwrap().is_none());

        // Search should not return deleted vector
        let results = index.search(&[1.0, 0.0, 0.0], 10, None).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.id != 1));

        // Deleting twice is an error and changes nothing
        assert!(matches!(index.delete(1), Err(Error::NotFound(1))));
        assert!(matches!(index.delete(42), Err(Error::NotFound(42))));
        assert_eq!(index.tombstones(), 1);
    }

    #[test]
    fn test_reinsert_revives_tombstone() {
        let index = create_test_index();
        index.delete(2).unwrap();
        index.insert(2, vec![0.0, 0.9, 0.1]).unwrap();

        assert_eq!(index.len(), 5);
        assert_eq!(index.tombstones(), 0);
        let results = index.search(&[0.0, 0.9, 0.1], 1, None).unwrap();
        assert_eq!(results[0].id, 2);
    }

    #[test]
    fn test_update_relinks() {
        let index = create_test_index();
        index.update(3, vec![0.9, 0.05, 0.0]).unwrap();

        let results = index.search(&[0.9, 0.05, 0.0], 1, None).unwrap();
        assert_eq!(results[0].id, 3);
        assert!(matches!(
            index.update(99, vec![0.0, 0.0, 0.0]),
            Err(Error::NotFound(99))
        ));

        index.delete(3).unwrap();
        assert!(matches!(
            index.update(3, vec![0.0, 0.0, 0.0]),
            Err(Error::NotFound(3))
        ));
    }

    #[test]
    fn test_compact_removes_tombstones() {
        let index = HnswIndex::new(DistanceMetric::Euclidean, 8, HnswConfig::with_m(8));
        let vectors = pseudo_random_vectors(300, 8, 7);
        for (i, v) in vectors.iter().enumerate() {
            index.insert(i as u64, v.clone()).unwrap();
        }
        for id in (0..300u64).filter(|id| id % 3 == 0) {
            index.delete(id).unwrap();
        }

        assert_eq!(index.compact().unwrap(), 100);
        assert_eq!(index.tombstones(), 0);
        assert_eq!(index.len(), 200);
        assert_eq!(index.compact().unwrap(), 0);

        for id in index.ids() {
            for layer in 0..=index.level(id).unwrap() {
                let neighbors = index.neighbors(id, layer).unwrap();
                assert!(neighbors.iter().all(|n| n % 3 != 0), "dangling link");
            }
        }

        let mut found = 0;
        for (i, v) in vectors.iter().enumerate().filter(|(i, _)| i % 3 != 0) {
            let results = index.search(v, 1, Some(64)).unwrap();
            if results.first().map(|r| r.id) == Some(i as u64) {
                found += 1;
            }
        }
        assert!(found >= 195, "only {} of 200 survivors found", found);
    }

    #[test]
    fn test_compact_reelects_entry_point() {
        let index = create_test_index();
        let entry = index.entry.read().unwrap();
        index.delete(entry.id).unwrap();
        index.compact().unwrap();

        let elected = index.entry.read().unwrap();
        assert_ne!(elected.id, entry.id);
        assert!(index.contains(elected.id));
        let max_level = index.ids().iter().filter_map(|&id| index.level(id)).max().unwrap();
        assert_eq!(elected.level, max_level);
    }

    #[test]
    fn test_neighbor_bounds_hold() {
        let config = HnswConfig::with_m(4);
        let index = HnswIndex::new(DistanceMetric::Euclidean, 4, config);
        for (i, v) in pseudo_random_vectors(400, 4, 11).into_iter().enumerate() {
            index.insert(i as u64, v).unwrap();
        }
        for id in index.ids() {
            for layer in 0..=index.level(id).unwrap() {
                let count = index.neighbors(id, layer).unwrap().len();
                assert!(count <= index.layer_bound(layer));
            }
        }
    }

    #[test]
    fn test_same_seed_same_levels() {
        let build = || {
            let index = HnswIndex::new(
                DistanceMetric::Euclidean,
                2,
                HnswConfig::with_m(4).with_seed(99),
            );
            for i in 0..50u64 {
                index.insert(i, vec![i as f32, 0.5]).unwrap();
            }
            (0..50u64).map(|i| index.level(i).unwrap()).collect::<Vec<_>>()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_expired_deadline_truncates() {
        let index = create_test_index();
        let options = SearchOptions::new(3).with_deadline(Instant::now() - Duration::from_millis(1));
        let outcome = index.search_with(&[1.0, 0.0, 0.0], &options).unwrap();
        assert!(outcome.truncated);
        assert!(outcome.hits.len() <= 3);
    }

    #[test]
    fn test_cancelled_search_truncates() {
        let index = create_test_index();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = index
            .search_with(&[1.0, 0.0, 0.0], &SearchOptions::new(2).with_cancel(cancel))
            .unwrap();
        assert!(outcome.truncated);

        let outcome = index
            .search_with(&[1.0, 0.0, 0.0], &SearchOptions::new(2))
            .unwrap();
        assert!(!outcome.truncated);
        assert_eq!(outcome.hits.len(), 2);
    }

    #[test]
    fn test_rank_exact_skips_dead_ids() {
        let index = create_test_index();
        index.delete(4).unwrap();
        let ranked = index.rank_exact(&[1.0, 1.0, 0.0], [4, 1, 2, 77], 5).unwrap();
        let ids: Vec<_> = ranked.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_recall_vs_brute_force() {
        // Build index with more vectors and higher ef_construction for quality
        let config = HnswConfig::with_m(16).with_ef_construction(200).with_ef_search(100);
        let index = HnswIndex::new(DistanceMetric::Euclidean, 8, config);

        let mut vectors = Vec::new();
        for i in 0..200 {
            let v: Vec<f32> = (0..8).map(|j| ((i * 8 + j) as f32).sin()).collect();
            vectors.push((i as u64, v.clone()));
            index.insert(i as u64, v).unwrap();
        }

        // Test recall with multiple queries
        let mut total_recall = 0.0;
        let num_queries = 10;
        let k = 10;

        for q in 0..num_queries {
            let query: Vec<f32> = (0..8).map(|j| ((q * 7 + j) as f32).cos()).collect();

            let hnsw_results: HashSet<_> = index
                .search(&query, k, Some(200))
                .unwrap()
                .iter()
                .map(|r| r.id)
                .collect();

            // Brute force results
            let mut distances: Vec<_> = vectors
                .iter()
                .map(|(id, v)| (*id, index.metric.compute(&query, v)))
                .collect();
            distances.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            let bf_results: HashSet<_> = distances.iter().take(k).map(|(id, _)| *id).collect();

            let intersection = hnsw_results.intersection(&bf_results).count();
            total_recall += intersection as f64 / k as f64;
        }

        let avg_recall = total_recall / num_queries as f64;
        assert!(
            avg_recall >= 0.9,
            "Average recall {:.2} is below threshold 0.9",
            avg_recall
        );
    }
}

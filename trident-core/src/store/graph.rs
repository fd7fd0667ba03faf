//! Relationship graph between records.
//!
//! Edges are directed and owned by their source record. A target that has
//! no record yet (or no longer has one) is kept in the adjacency but never
//! traversed or returned, so edges come back to life when the target is
//! inserted again.

use std::collections::{BTreeSet, HashMap, HashSet};

use roaring::RoaringTreemap;

use crate::store::query::Direction;
use crate::vector::VectorId;

/// Adjacency lists in both directions.
#[derive(Debug, Default)]
pub struct RelationGraph {
    outgoing: HashMap<VectorId, BTreeSet<VectorId>>,
    incoming: HashMap<VectorId, HashSet<VectorId>>,
    /// Ids that currently have a record.
    present: RoaringTreemap,
}

impl RelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: VectorId) -> bool {
        self.present.contains(id)
    }

    /// Number of edges whose source is present.
    pub fn edge_count(&self) -> usize {
        self.outgoing.values().map(BTreeSet::len).sum()
    }

    /// Marks `id` present and replaces its outgoing edges.
    pub fn set_edges(&mut self, id: VectorId, edges: &BTreeSet<VectorId>) {
        self.clear_outgoing(id);
        self.present.insert(id);
        for &target in edges {
            self.incoming.entry(target).or_default().insert(id);
        }
        if !edges.is_empty() {
            self.outgoing.insert(id, edges.clone());
        }
    }

    /// Drops `id` and its outgoing edges. Edges other records hold to it
    /// stay in place.
    pub fn remove(&mut self, id: VectorId) {
        self.clear_outgoing(id);
        self.present.remove(id);
    }

    fn clear_outgoing(&mut self, id: VectorId) {
        let Some(old) = self.outgoing.remove(&id) else {
            return;
        };
        for target in old {
            if let Some(sources) = self.incoming.get_mut(&target) {
                sources.remove(&id);
                if sources.is_empty() {
                    self.incoming.remove(&target);
                }
            }
        }
    }

    /// Present records reachable from `anchor` in at most `max_hops` steps.
    ///
    /// The walk only passes through present records. The anchor is part of
    /// the result only if `include_anchor` is set.
    pub fn reachable(
        &self,
        anchor: VectorId,
        max_hops: usize,
        direction: Direction,
        include_anchor: bool,
    ) -> RoaringTreemap {
        let mut seen = RoaringTreemap::new();
        if !self.present.contains(anchor) {
            return seen;
        }
        seen.insert(anchor);

        let mut frontier = vec![anchor];
        for _ in 0..max_hops {
            let mut next = Vec::new();
            for id in frontier {
                for neighbor in self.neighbors(id, direction) {
                    if self.present.contains(neighbor) && seen.insert(neighbor) {
                        next.push(neighbor);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        if !include_anchor {
            seen.remove(anchor);
        }
        seen
    }

    fn neighbors(&self, id: VectorId, direction: Direction) -> Vec<VectorId> {
        let out = || self.outgoing.get(&id).into_iter().flatten().copied();
        let inc = || self.incoming.get(&id).into_iter().flatten().copied();
        match direction {
            Direction::Outgoing => out().collect(),
            Direction::Incoming => inc().collect(),
            Direction::Both => out().chain(inc()).collect(),
        }
    }
}

//! Graph nodes.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::vector::VectorId;

/// Lifecycle of an index node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Searchable.
    Live,
    /// Deleted. Still traversed by searches, never returned.
    Tombstoned,
    /// Removed by compaction. Only observable through a stale handle.
    Compacted,
}

impl NodeState {
    pub(crate) fn to_tag(self) -> u8 {
        match self {
            NodeState::Live => 0,
            NodeState::Tombstoned => 1,
            NodeState::Compacted => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(NodeState::Live),
            1 => Ok(NodeState::Tombstoned),
            2 => Ok(NodeState::Compacted),
            other => Err(Error::IndexCorrupt(format!("unknown node state {}", other))),
        }
    }
}

/// A node in the proximity graph.
///
/// The level never changes after creation. Neighbor lists for layers
/// `0..=level` sit behind the node's own lock; callers must not hold this
/// lock while locking another node.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) id: VectorId,
    pub(crate) level: usize,
    state: AtomicU8,
    pub(crate) links: RwLock<Vec<Vec<VectorId>>>,
}

impl Node {
    pub(crate) fn new(id: VectorId, level: usize) -> Self {
        Self::with_links(id, level, NodeState::Live, vec![Vec::new(); level + 1])
    }

    pub(crate) fn with_links(
        id: VectorId,
        level: usize,
        state: NodeState,
        links: Vec<Vec<VectorId>>,
    ) -> Self {
        Self {
            id,
            level,
            state: AtomicU8::new(state.to_tag()),
            links: RwLock::new(links),
        }
    }

    pub(crate) fn state(&self) -> NodeState {
        match self.state.load(Ordering::Acquire) {
            0 => NodeState::Live,
            1 => NodeState::Tombstoned,
            _ => NodeState::Compacted,
        }
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.state.store(state.to_tag(), Ordering::Release);
    }

    /// Atomically moves from `from` to `to`. Returns false if the node was
    /// not in `from`.
    pub(crate) fn transition(&self, from: NodeState, to: NodeState) -> bool {
        self.state
            .compare_exchange(
                from.to_tag(),
                to.to_tag(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        self.state() == NodeState::Live
    }

    /// Copy of the neighbor list at `layer` (empty above the node's level).
    pub(crate) fn neighbors(&self, layer: usize) -> Vec<VectorId> {
        self.links.read().get(layer).cloned().unwrap_or_default()
    }

    pub(crate) fn set_neighbors(&self, layer: usize, neighbors: Vec<VectorId>) {
        if let Some(slot) = self.links.write().get_mut(layer) {
            *slot = neighbors;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let node = Node::new(7, 2);
        assert!(node.is_live());
        assert!(node.transition(NodeState::Live, NodeState::Tombstoned));
        assert!(!node.transition(NodeState::Live, NodeState::Tombstoned));
        assert_eq!(node.state(), NodeState::Tombstoned);
        node.set_state(NodeState::Compacted);
        assert_eq!(node.state(), NodeState::Compacted);
    }

    #[test]
    fn test_neighbors_per_layer() {
        let node = Node::new(1, 1);
        node.set_neighbors(0, vec![2, 3]);
        node.set_neighbors(1, vec![4]);
        node.set_neighbors(5, vec![9]);
        assert_eq!(node.neighbors(0), vec![2, 3]);
        assert_eq!(node.neighbors(1), vec![4]);
        assert!(node.neighbors(2).is_empty());
    }

    #[test]
    fn test_state_tags() {
        for state in [NodeState::Live, NodeState::Tombstoned, NodeState::Compacted] {
            assert_eq!(NodeState::from_tag(state.to_tag()).unwrap(), state);
        }
        assert!(NodeState::from_tag(3).is_err());
    }
}

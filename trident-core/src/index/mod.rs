//! Approximate nearest neighbor index.
//!
//! [`HnswIndex`] is the vector index used by the store. It can be driven on
//! its own when no filtering or persistence is needed.

pub mod hnsw;
pub(crate) mod node;
pub mod snapshot;
pub(crate) mod vectors;

pub use hnsw::{CancelFlag, HnswConfig, HnswIndex, SearchOptions, SearchOutcome, SearchResult};
pub use node::NodeState;
pub use vectors::VectorStorage;

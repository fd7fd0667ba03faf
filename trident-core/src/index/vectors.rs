//! Vector payload storage for the index.
//!
//! Resident tables keep every vector in memory. Paged tables keep vectors
//! in the key-value store under the store's `vec/<id>` keys and hold a working set in an
//! index-layer cache region, so the resident footprint follows the cache
//! budget rather than the collection size.

use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::CacheRegion;
use crate::error::{Error, Result};
use crate::storage::{KvStore, Keyspace};
use crate::vector::{SharedVector, VectorId};

/// Where an index keeps its vectors.
#[derive(Clone)]
pub enum VectorStorage {
    /// All vectors in memory.
    Resident,
    /// Vectors in `store` under `keys`, with `cache` holding the hot ones.
    Paged {
        store: Arc<dyn KvStore>,
        keys: Keyspace,
        cache: Arc<CacheRegion<VectorId, SharedVector>>,
    },
}

impl std::fmt::Debug for VectorStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorStorage::Resident => f.write_str("Resident"),
            VectorStorage::Paged { keys, cache, .. } => f
                .debug_struct("Paged")
                .field("store", &keys.name())
                .field("cached", &cache.len())
                .finish(),
        }
    }
}

pub(crate) enum VectorTable {
    Resident(DashMap<VectorId, SharedVector>),
    Paged {
        store: Arc<dyn KvStore>,
        keys: Keyspace,
        cache: Arc<CacheRegion<VectorId, SharedVector>>,
        dimension: usize,
    },
}

impl VectorTable {
    pub(crate) fn new(storage: VectorStorage, dimension: usize) -> Self {
        match storage {
            VectorStorage::Resident => VectorTable::Resident(DashMap::new()),
            VectorStorage::Paged { store, keys, cache } => VectorTable::Paged {
                store,
                keys,
                cache,
                dimension,
            },
        }
    }

    pub(crate) fn is_paged(&self) -> bool {
        matches!(self, VectorTable::Paged { .. })
    }

    /// Looks up a vector. `Ok(None)` means the node has no payload (it was
    /// compacted, or its insert has not stored it yet).
    pub(crate) fn get(&self, id: VectorId) -> Result<Option<SharedVector>> {
        match self {
            VectorTable::Resident(map) => Ok(map.get(&id).map(|v| Arc::clone(v.value()))),
            VectorTable::Paged {
                store,
                keys,
                cache,
                dimension,
            } => {
                if let Some(vector) = cache.get(&id) {
                    return Ok(Some(vector));
                }
                let Some(bytes) = store.get(&keys.vector_key(id))? else {
                    return Ok(None);
                };
                let vector = decode(id, &bytes, *dimension)?;
                cache.insert(id, Arc::clone(&vector));
                Ok(Some(vector))
            }
        }
    }

    pub(crate) fn put(&self, id: VectorId, vector: SharedVector) -> Result<()> {
        match self {
            VectorTable::Resident(map) => {
                map.insert(id, vector);
                Ok(())
            }
            VectorTable::Paged { store, keys, cache, .. } => {
                store.put(&keys.vector_key(id), &encode(&vector))?;
                cache.insert(id, vector);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&self, id: VectorId) -> Result<()> {
        match self {
            VectorTable::Resident(map) => {
                map.remove(&id);
                Ok(())
            }
            VectorTable::Paged { store, keys, cache, .. } => {
                cache.remove(&id);
                store.delete(&keys.vector_key(id))?;
                Ok(())
            }
        }
    }
}

fn encode(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode(id: VectorId, bytes: &[u8], dimension: usize) -> Result<SharedVector> {
    if bytes.len() != dimension * 4 {
        return Err(Error::IndexCorrupt(format!(
            "stored vector {} has {} bytes, expected {}",
            id,
            bytes.len(),
            dimension * 4
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RegionKind;
    use crate::storage::MemoryKvStore;

    fn keys() -> Keyspace {
        Keyspace::new("test").unwrap()
    }

    fn paged(capacity: u64) -> (Arc<MemoryKvStore>, VectorTable) {
        let store = Arc::new(MemoryKvStore::new());
        let cache = Arc::new(CacheRegion::new(RegionKind::IndexLayer, capacity));
        let table = VectorTable::new(
            VectorStorage::Paged {
                store: store.clone(),
                keys: keys(),
                cache,
            },
            3,
        );
        (store, table)
    }

    #[test]
    fn test_resident_table() {
        let table = VectorTable::new(VectorStorage::Resident, 2);
        table.put(1, Arc::from(vec![1.0, 2.0])).unwrap();
        assert_eq!(table.get(1).unwrap().as_deref(), Some(&[1.0, 2.0][..]));
        table.remove(1).unwrap();
        assert!(table.get(1).unwrap().is_none());
        assert!(!table.is_paged());
    }

    #[test]
    fn test_paged_table_reads_through_cache() {
        // Room for a single three-component vector.
        let (store, table) = paged(100);
        table.put(1, Arc::from(vec![1.0, 0.0, 0.0])).unwrap();
        table.put(2, Arc::from(vec![0.0, 1.0, 0.0])).unwrap();

        assert_eq!(store.len(), 2);
        // Vector 1 was evicted from the cache but is still readable.
        assert_eq!(table.get(1).unwrap().as_deref(), Some(&[1.0, 0.0, 0.0][..]));

        table.remove(1).unwrap();
        assert!(table.get(1).unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_paged_table_rejects_bad_payload() {
        let (store, table) = paged(1024);
        store.put(&keys().vector_key(5), &[0, 1, 2]).unwrap();
        assert!(matches!(table.get(5), Err(Error::IndexCorrupt(_))));
    }
}

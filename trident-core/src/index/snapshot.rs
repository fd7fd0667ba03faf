//! Binary snapshot of an HNSW index.
//!
//! # Format
//!
//! All integers little endian.
//!
//! ```text
//! [magic:"TRIDHNSW"][version:u32][dimension:u32][metric:u8]
//! [m:u32][m_max0:u32][ef_construction:u32][ef_search:u32][seed:u64]
//! [has_entry:u8][entry_id:u64][entry_level:u32]
//! [node_count:u64]
//! node_count x { [id:u64][state:u8][level:u32] (level+1) x { [count:u32][ids:u64 x count] } }
//! node_count x { [component:f32 x dimension] }
//! [crc32:u32]
//! ```
//!
//! Nodes are written in ascending id order and vectors follow the same
//! order. The checksum covers every preceding byte.

use std::collections::HashSet;

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::index::hnsw::{EntryPoint, HnswConfig, HnswIndex};
use crate::index::node::{Node, NodeState};
use crate::index::vectors::VectorStorage;
use crate::vector::{SharedVector, VectorId};

/// File magic.
pub const MAGIC: &[u8; 8] = b"TRIDHNSW";
/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Sanity cap on stored levels.
const MAX_STORED_LEVEL: u32 = 64;

impl HnswIndex {
    /// Serializes the index. Writers are blocked while the snapshot is
    /// taken so it reflects a single point in time.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let _structure = self.structure.write();

        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .map(|entry| std::sync::Arc::clone(entry.value()))
            .collect();
        nodes.sort_unstable_by_key(|n| n.id);
        let entry = *self.entry.read();

        let mut buf = Vec::with_capacity(64 + nodes.len() * (self.dimension * 4 + 64));
        buf.extend_from_slice(MAGIC);
        put_u32(&mut buf, FORMAT_VERSION);
        put_u32(&mut buf, self.dimension as u32);
        buf.push(self.metric.to_tag());
        put_u32(&mut buf, self.config.m as u32);
        put_u32(&mut buf, self.config.m_max0 as u32);
        put_u32(&mut buf, self.config.ef_construction as u32);
        put_u32(&mut buf, self.config.ef_search as u32);
        put_u64(&mut buf, self.config.seed);

        match entry {
            Some(entry) => {
                buf.push(1);
                put_u64(&mut buf, entry.id);
                put_u32(&mut buf, entry.level as u32);
            }
            None => {
                buf.push(0);
                put_u64(&mut buf, 0);
                put_u32(&mut buf, 0);
            }
        }

        put_u64(&mut buf, nodes.len() as u64);
        for node in &nodes {
            put_u64(&mut buf, node.id);
            buf.push(node.state().to_tag());
            put_u32(&mut buf, node.level as u32);
            let links = node.links.read();
            for layer in links.iter() {
                put_u32(&mut buf, layer.len() as u32);
                for &id in layer {
                    put_u64(&mut buf, id);
                }
            }
        }

        for node in &nodes {
            let vector = self.vectors.get(node.id)?.ok_or_else(|| {
                Error::IndexCorrupt(format!("node {} has no stored vector", node.id))
            })?;
            for value in vector.iter() {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }

        let checksum = crc32fast::hash(&buf);
        put_u32(&mut buf, checksum);

        tracing::debug!(nodes = nodes.len(), bytes = buf.len(), "serialized index snapshot");
        Ok(buf)
    }

    /// Loads an index from [`to_bytes`](Self::to_bytes) output.
    ///
    /// Fails with `IndexCorrupt` on a bad magic, version, metric, checksum,
    /// truncation, inconsistent graph, or a dimension other than
    /// `expected_dimension`. The level multiplier is not stored and is
    /// reset to `1/ln(m)`.
    pub fn from_bytes(
        bytes: &[u8],
        expected_dimension: usize,
        storage: VectorStorage,
    ) -> Result<Self> {
        if bytes.len() < MAGIC.len() + 4 {
            return Err(Error::IndexCorrupt("snapshot is truncated".into()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(body);
        if stored != actual {
            return Err(Error::IndexCorrupt(format!(
                "snapshot checksum mismatch: expected {}, got {}",
                stored, actual
            )));
        }

        let mut reader = Reader::new(body);
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(Error::IndexCorrupt("bad snapshot magic".into()));
        }
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(Error::IndexCorrupt(format!(
                "unsupported snapshot version {}",
                version
            )));
        }
        let dimension = reader.u32()? as usize;
        if dimension != expected_dimension {
            return Err(Error::IndexCorrupt(format!(
                "snapshot dimension {} does not match expected {}",
                dimension, expected_dimension
            )));
        }
        let metric = DistanceMetric::from_tag(reader.u8()?)?;

        let m = reader.u32()? as usize;
        let config = HnswConfig {
            m,
            m_max0: reader.u32()? as usize,
            ef_construction: reader.u32()? as usize,
            ef_search: reader.u32()? as usize,
            level_multiplier: HnswConfig::default_level_multiplier(m),
            seed: reader.u64()?,
        };
        config
            .validate()
            .map_err(|e| Error::IndexCorrupt(format!("snapshot config invalid: {}", e)))?;

        let has_entry = reader.u8()?;
        let entry_id = reader.u64()?;
        let entry_level = reader.u32()? as usize;
        let entry = match has_entry {
            0 => None,
            1 => Some(EntryPoint {
                id: entry_id,
                level: entry_level,
            }),
            other => {
                return Err(Error::IndexCorrupt(format!(
                    "bad entry flag {}",
                    other
                )))
            }
        };

        let count = reader.u64()? as usize;
        // Every node needs at least 17 bytes; refuse counts the body cannot hold.
        if count > reader.remaining() / 17 {
            return Err(Error::IndexCorrupt(format!(
                "node count {} exceeds snapshot size",
                count
            )));
        }

        let mut nodes = Vec::with_capacity(count);
        let mut ids: HashSet<VectorId> = HashSet::with_capacity(count);
        for _ in 0..count {
            let id = reader.u64()?;
            let state = NodeState::from_tag(reader.u8()?)?;
            if state == NodeState::Compacted {
                return Err(Error::IndexCorrupt(format!("node {} is compacted", id)));
            }
            let level = reader.u32()?;
            if level > MAX_STORED_LEVEL {
                return Err(Error::IndexCorrupt(format!("node {} has level {}", id, level)));
            }
            let level = level as usize;

            let mut links = Vec::with_capacity(level + 1);
            for layer in 0..=level {
                let len = reader.u32()? as usize;
                let bound = if layer == 0 { config.m_max0 } else { config.m };
                if len > bound {
                    return Err(Error::IndexCorrupt(format!(
                        "node {} has {} neighbors at layer {} (bound {})",
                        id, len, layer, bound
                    )));
                }
                let mut list = Vec::with_capacity(len);
                for _ in 0..len {
                    list.push(reader.u64()?);
                }
                links.push(list);
            }

            if !ids.insert(id) {
                return Err(Error::IndexCorrupt(format!("node {} stored twice", id)));
            }
            nodes.push(Node::with_links(id, level, state, links));
        }

        for node in &nodes {
            let links = node.links.read();
            if let Some(missing) = links.iter().flatten().find(|id| !ids.contains(id)) {
                return Err(Error::IndexCorrupt(format!(
                    "node {} links to unknown node {}",
                    node.id, missing
                )));
            }
        }
        match entry {
            Some(entry) => {
                let valid = nodes
                    .iter()
                    .any(|n| n.id == entry.id && n.level == entry.level);
                if !valid {
                    return Err(Error::IndexCorrupt(format!(
                        "entry point {} is not a node at level {}",
                        entry.id, entry.level
                    )));
                }
            }
            None if !nodes.is_empty() => {
                return Err(Error::IndexCorrupt("nodes stored without an entry point".into()));
            }
            None => {}
        }

        let mut vectors: Vec<SharedVector> = Vec::with_capacity(count);
        for _ in 0..count {
            let mut vector = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                vector.push(reader.f32()?);
            }
            vectors.push(vector.into());
        }
        if reader.remaining() != 0 {
            return Err(Error::IndexCorrupt(format!(
                "{} unexpected trailing bytes",
                reader.remaining()
            )));
        }

        let index = HnswIndex::with_storage(metric, dimension, config, storage);
        for (node, vector) in nodes.into_iter().zip(vectors) {
            index.vectors.put(node.id, vector)?;
            index.restore_node(node);
        }
        *index.entry.write() = entry;

        tracing::info!(
            live = index.len(),
            tombstones = index.tombstones(),
            dimension,
            "loaded index snapshot"
        );
        Ok(index)
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Bounds-checked cursor over the snapshot body.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::IndexCorrupt(format!(
                "snapshot truncated at byte {}",
                self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(b);
        Ok(u64::from_le_bytes(array))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> HnswIndex {
        let index = HnswIndex::new(DistanceMetric::Cosine, 4, HnswConfig::with_m(4));
        for i in 0..40u64 {
            let x = i as f32;
            index
                .insert(i, vec![x.sin(), x.cos(), (x * 0.5).sin(), 1.0])
                .unwrap();
        }
        index.delete(7).unwrap();
        index
    }

    #[test]
    fn test_roundtrip_preserves_results() {
        let index = sample_index();
        let bytes = index.to_bytes().unwrap();
        let loaded = HnswIndex::from_bytes(&bytes, 4, VectorStorage::Resident).unwrap();

        assert_eq!(loaded.len(), index.len());
        assert_eq!(loaded.tombstones(), 1);
        assert_eq!(loaded.metric(), DistanceMetric::Cosine);
        assert_eq!(loaded.config().m_max0, 8);

        for i in 0..40u64 {
            let x = i as f32;
            let query = [x.cos(), x.sin(), 0.3, 1.0];
            assert_eq!(
                index.search(&query, 5, None).unwrap(),
                loaded.search(&query, 5, None).unwrap()
            );
        }
        // Serializing again yields the same bytes.
        assert_eq!(loaded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_empty_index_roundtrip() {
        let index = HnswIndex::new(DistanceMetric::Euclidean, 2, HnswConfig::default());
        let bytes = index.to_bytes().unwrap();
        let loaded = HnswIndex::from_bytes(&bytes, 2, VectorStorage::Resident).unwrap();
        assert!(loaded.is_empty());
        assert!(loaded.search(&[0.0, 0.0], 3, None).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_corruption() {
        let bytes = sample_index().to_bytes().unwrap();

        let mut flipped = bytes.clone();
        flipped[40] ^= 0x01;
        assert!(matches!(
            HnswIndex::from_bytes(&flipped, 4, VectorStorage::Resident),
            Err(Error::IndexCorrupt(_))
        ));

        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(
            HnswIndex::from_bytes(truncated, 4, VectorStorage::Resident),
            Err(Error::IndexCorrupt(_))
        ));

        assert!(matches!(
            HnswIndex::from_bytes(&[], 4, VectorStorage::Resident),
            Err(Error::IndexCorrupt(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let bytes = sample_index().to_bytes().unwrap();
        assert!(matches!(
            HnswIndex::from_bytes(&bytes, 8, VectorStorage::Resident),
            Err(Error::IndexCorrupt(_))
        ));
    }

    #[test]
    fn test_rejects_bad_magic_with_valid_checksum() {
        let bytes = sample_index().to_bytes().unwrap();
        let mut body = bytes[..bytes.len() - 4].to_vec();
        body[0] = b'X';
        let checksum = crc32fast::hash(&body);
        body.extend_from_slice(&checksum.to_le_bytes());
        let err = HnswIndex::from_bytes(&body, 4, VectorStorage::Resident).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }
}

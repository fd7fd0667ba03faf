//! Records owned by the store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Weighted;
use crate::vector::VectorId;

/// Opaque JSON metadata attached to a record.
pub type Metadata = serde_json::Map<String, Value>;

/// A discrete facet value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FacetValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&str> for FacetValue {
    fn from(s: &str) -> Self {
        FacetValue::Str(s.to_string())
    }
}

impl From<String> for FacetValue {
    fn from(s: String) -> Self {
        FacetValue::Str(s)
    }
}

impl From<i64> for FacetValue {
    fn from(n: i64) -> Self {
        FacetValue::Int(n)
    }
}

impl From<i32> for FacetValue {
    fn from(n: i32) -> Self {
        FacetValue::Int(n as i64)
    }
}

impl From<bool> for FacetValue {
    fn from(b: bool) -> Self {
        FacetValue::Bool(b)
    }
}

/// Everything about a record except its vector. This is the document
/// persisted under `rec/<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordAttributes {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub facets: BTreeMap<String, FacetValue>,
    /// Ids this record relates to (outgoing edges).
    #[serde(default)]
    pub edges: BTreeSet<VectorId>,
}

impl RecordAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_facet(mut self, name: impl Into<String>, value: impl Into<FacetValue>) -> Self {
        self.facets.insert(name.into(), value.into());
        self
    }

    pub fn with_edge(mut self, target: VectorId) -> Self {
        self.edges.insert(target);
        self
    }
}

impl Weighted for RecordAttributes {
    fn weight(&self) -> usize {
        let facets: usize = self
            .facets
            .iter()
            .map(|(name, value)| {
                name.len()
                    + match value {
                        FacetValue::Str(s) => s.len() + 24,
                        _ => 16,
                    }
            })
            .sum();
        let metadata: usize = self
            .metadata
            .iter()
            .map(|(k, v)| k.len() + json_weight(v))
            .sum();
        facets + metadata + self.edges.len() * 16
    }
}

/// Rough heap size of a JSON value.
pub(crate) fn json_weight(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 16,
        Value::String(s) => 24 + s.len(),
        Value::Array(items) => 24 + items.iter().map(json_weight).sum::<usize>(),
        Value::Object(map) => {
            32 + map
                .iter()
                .map(|(k, v)| k.len() + json_weight(v))
                .sum::<usize>()
        }
    }
}

/// A vector with its metadata, facets and edges.
///
/// # Example
///
/// ```
/// use trident_core::store::{FacetValue, VectorRecord};
///
/// let record = VectorRecord::new(7, vec![0.1, 0.2])
///     .with_metadata("title", "intro")
///     .with_facet("lang", "rust")
///     .with_edge(3);
/// assert_eq!(record.facets["lang"], FacetValue::Str("rust".into()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: VectorId,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub facets: BTreeMap<String, FacetValue>,
    #[serde(default)]
    pub edges: BTreeSet<VectorId>,
}

impl VectorRecord {
    pub fn new(id: VectorId, vector: impl Into<Vec<f32>>) -> Self {
        Self::from_parts(id, vector.into(), RecordAttributes::default())
    }

    pub fn from_parts(id: VectorId, vector: Vec<f32>, attributes: RecordAttributes) -> Self {
        Self {
            id,
            vector,
            metadata: attributes.metadata,
            facets: attributes.facets,
            edges: attributes.edges,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_facet(mut self, name: impl Into<String>, value: impl Into<FacetValue>) -> Self {
        self.facets.insert(name.into(), value.into());
        self
    }

    pub fn with_edge(mut self, target: VectorId) -> Self {
        self.edges.insert(target);
        self
    }

    /// Splits off the vector.
    pub fn into_parts(self) -> (VectorId, Vec<f32>, RecordAttributes) {
        (
            self.id,
            self.vector,
            RecordAttributes {
                metadata: self.metadata,
                facets: self.facets,
                edges: self.edges,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facet_value_json_is_untagged() {
        let attrs = RecordAttributes::new()
            .with_facet("lang", "rust")
            .with_facet("year", 2024)
            .with_facet("draft", false);
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(json["facets"]["lang"], "rust");
        assert_eq!(json["facets"]["year"], 2024);
        assert_eq!(json["facets"]["draft"], false);

        let back: RecordAttributes = serde_json::from_value(json).unwrap();
        assert_eq!(back, attrs);
    }

    #[test]
    fn test_record_parts() {
        let record = VectorRecord::new(1, vec![1.0, 2.0])
            .with_metadata("title", "a")
            .with_edge(2)
            .with_edge(2);
        let (id, vector, attrs) = record.clone().into_parts();
        assert_eq!(id, 1);
        assert_eq!(attrs.edges.len(), 1);
        assert_eq!(VectorRecord::from_parts(id, vector, attrs), record);
    }

    #[test]
    fn test_weight_grows_with_content() {
        let small = RecordAttributes::new().with_metadata("k", "v");
        let large = RecordAttributes::new().with_metadata("k", "v".repeat(1000));
        assert!(large.weight() > small.weight() + 900);
    }
}

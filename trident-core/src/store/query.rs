//! Query filters combining facet predicates and graph reachability.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::cache::Weighted;
use crate::store::record::FacetValue;
use crate::vector::VectorId;

/// Exact-match condition on one facet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetPredicate {
    /// Facet equals the value.
    Equals { field: String, value: FacetValue },
    /// Facet equals one of the values.
    AnyOf {
        field: String,
        values: Vec<FacetValue>,
    },
}

impl FacetPredicate {
    pub fn eq(field: impl Into<String>, value: impl Into<FacetValue>) -> Self {
        FacetPredicate::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn any_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FacetValue>,
    {
        FacetPredicate::AnyOf {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Which edges a graph traversal follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From a record to the ids it lists.
    #[default]
    Outgoing,
    /// From a record to the records that list it.
    Incoming,
    Both,
}

/// Restricts results to records within `max_hops` edges of `anchor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphConstraint {
    pub anchor: VectorId,
    pub max_hops: usize,
    #[serde(default)]
    pub direction: Direction,
    /// Whether the anchor itself may be returned.
    #[serde(default)]
    pub include_anchor: bool,
}

impl GraphConstraint {
    pub fn new(anchor: VectorId, max_hops: usize) -> Self {
        Self {
            anchor,
            max_hops,
            direction: Direction::Outgoing,
            include_anchor: false,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn including_anchor(mut self) -> Self {
        self.include_anchor = true;
        self
    }
}

/// Filter applied to a store query. All facet predicates must hold, and
/// the graph constraint, if any, must hold too.
///
/// # Example
///
/// ```
/// use trident_core::store::{Direction, QueryFilter};
///
/// let filter = QueryFilter::new()
///     .facet_eq("lang", "rust")
///     .facet_any_of("year", [2023, 2024])
///     .within_hops(42, 2)
///     .with_direction(Direction::Both);
/// assert!(!filter.is_empty());
/// assert!(QueryFilter::new().is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default)]
    pub facets: Vec<FacetPredicate>,
    #[serde(default)]
    pub graph: Option<GraphConstraint>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn facet(mut self, predicate: FacetPredicate) -> Self {
        self.facets.push(predicate);
        self
    }

    pub fn facet_eq(self, field: impl Into<String>, value: impl Into<FacetValue>) -> Self {
        self.facet(FacetPredicate::eq(field, value))
    }

    pub fn facet_any_of<I, V>(self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FacetValue>,
    {
        self.facet(FacetPredicate::any_of(field, values))
    }

    pub fn graph(mut self, constraint: GraphConstraint) -> Self {
        self.graph = Some(constraint);
        self
    }

    /// Shorthand for an outgoing graph constraint without the anchor.
    pub fn within_hops(self, anchor: VectorId, max_hops: usize) -> Self {
        self.graph(GraphConstraint::new(anchor, max_hops))
    }

    /// Sets the direction of the graph constraint, if there is one.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        if let Some(graph) = self.graph.as_mut() {
            graph.direction = direction;
        }
        self
    }

    /// Lets the graph anchor itself appear in results.
    pub fn including_anchor(mut self) -> Self {
        if let Some(graph) = self.graph.as_mut() {
            graph.include_anchor = true;
        }
        self
    }

    /// True if the filter restricts nothing.
    pub fn is_empty(&self) -> bool {
        self.facets.is_empty() && self.graph.is_none()
    }
}

/// Everything that determines a query's result: the query vector's bits,
/// `k`, the beam width override and the filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct QueryKey {
    bits: Vec<u32>,
    k: usize,
    ef: Option<usize>,
    filter: QueryFilter,
}

impl QueryKey {
    pub(crate) fn new(vector: &[f32], k: usize, ef: Option<usize>, filter: &QueryFilter) -> Self {
        Self {
            bits: vector.iter().map(|x| x.to_bits()).collect(),
            k,
            ef,
            filter: filter.clone(),
        }
    }

    /// Hash used as the result-cache slot. Equal keys share a slot; unequal
    /// keys may too, so a hit must still compare the full key.
    pub(crate) fn fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl Weighted for QueryKey {
    fn weight(&self) -> usize {
        let facets: usize = self
            .filter
            .facets
            .iter()
            .map(|predicate| match predicate {
                FacetPredicate::Equals { field, .. } => field.len() + 32,
                FacetPredicate::AnyOf { field, values } => field.len() + 32 * values.len(),
            })
            .sum();
        self.bits.len() * 4 + facets + 48
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_json() {
        let json = r#"{
            "facets": [
                {"equals": {"field": "lang", "value": "rust"}},
                {"any_of": {"field": "year", "values": [2023, 2024]}}
            ],
            "graph": {"anchor": 7, "max_hops": 2, "direction": "both"}
        }"#;
        let filter: QueryFilter = serde_json::from_str(json).unwrap();
        let expected = QueryFilter::new()
            .facet_eq("lang", "rust")
            .facet_any_of("year", [2023, 2024])
            .graph(GraphConstraint::new(7, 2).with_direction(Direction::Both));
        assert_eq!(filter, expected);
    }

    #[test]
    fn test_direction_needs_a_graph() {
        let filter = QueryFilter::new().with_direction(Direction::Incoming);
        assert!(filter.graph.is_none());
        let filter = QueryFilter::new().within_hops(1, 1).including_anchor();
        assert!(filter.graph.unwrap().include_anchor);
    }

    #[test]
    fn test_query_key_distinguishes_inputs() {
        let filter = QueryFilter::new().facet_eq("lang", "rust");
        let base = QueryKey::new(&[1.0, 2.0], 5, None, &filter);
        assert_eq!(base, QueryKey::new(&[1.0, 2.0], 5, None, &filter));
        assert_eq!(base.fingerprint(), QueryKey::new(&[1.0, 2.0], 5, None, &filter).fingerprint());

        let others = [
            QueryKey::new(&[1.0, 2.5], 5, None, &filter),
            QueryKey::new(&[1.0, 2.0], 6, None, &filter),
            QueryKey::new(&[1.0, 2.0], 5, Some(64), &filter),
            QueryKey::new(&[1.0, 2.0], 5, None, &QueryFilter::new()),
        ];
        for other in others {
            assert_ne!(base, other);
        }
        // -0.0 and 0.0 compare equal as floats but are different queries.
        assert_ne!(
            QueryKey::new(&[0.0], 1, None, &filter),
            QueryKey::new(&[-0.0], 1, None, &filter)
        );
    }
}

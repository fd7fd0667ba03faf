//! Inverted facet index.
//!
//! Maps `(facet, value)` pairs to roaring bitmaps of record ids so a
//! conjunction of predicates becomes a handful of bitmap intersections.

use std::collections::{BTreeMap, HashMap};

use roaring::RoaringTreemap;

use crate::store::query::FacetPredicate;
use crate::store::record::FacetValue;
use crate::vector::VectorId;

/// Bitmap index over record facets.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use trident_core::store::{FacetIndex, FacetPredicate, FacetValue};
///
/// let mut index = FacetIndex::new();
/// index.insert(1, &BTreeMap::from([("lang".to_string(), FacetValue::from("rust"))]));
/// index.insert(2, &BTreeMap::from([("lang".to_string(), FacetValue::from("go"))]));
///
/// let hits = index.matching(&[FacetPredicate::eq("lang", "rust")]).unwrap();
/// assert!(hits.contains(1));
/// assert!(!hits.contains(2));
/// ```
#[derive(Debug, Default)]
pub struct FacetIndex {
    /// facet name -> value -> ids
    fields: HashMap<String, HashMap<FacetValue, RoaringTreemap>>,
    /// Every id with at least one facet.
    all_ids: RoaringTreemap,
}

impl FacetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids carrying at least one facet.
    pub fn len(&self) -> u64 {
        self.all_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all_ids.is_empty()
    }

    /// Indexes the facets of `id`.
    pub fn insert(&mut self, id: VectorId, facets: &BTreeMap<String, FacetValue>) {
        if facets.is_empty() {
            return;
        }
        self.all_ids.insert(id);
        for (name, value) in facets {
            self.fields
                .entry(name.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(id);
        }
    }

    /// Removes `id` from the bitmaps of `facets`. Emptied bitmaps are
    /// dropped.
    pub fn remove(&mut self, id: VectorId, facets: &BTreeMap<String, FacetValue>) {
        self.all_ids.remove(id);
        for (name, value) in facets {
            let Some(values) = self.fields.get_mut(name) else {
                continue;
            };
            if let Some(bitmap) = values.get_mut(value) {
                bitmap.remove(id);
                if bitmap.is_empty() {
                    values.remove(value);
                }
            }
            if values.is_empty() {
                self.fields.remove(name);
            }
        }
    }

    /// Ids satisfying every predicate. `None` means no predicates were
    /// given, i.e. no facet restriction at all.
    pub fn matching(&self, predicates: &[FacetPredicate]) -> Option<RoaringTreemap> {
        let mut predicates = predicates.iter();
        let first = predicates.next()?;

        let mut result = self.eval(first);
        for predicate in predicates {
            if result.is_empty() {
                break;
            }
            result &= self.eval(predicate);
        }
        Some(result)
    }

    fn eval(&self, predicate: &FacetPredicate) -> RoaringTreemap {
        match predicate {
            FacetPredicate::Equals { field, value } => self.lookup(field, value),
            FacetPredicate::AnyOf { field, values } => {
                let mut result = RoaringTreemap::new();
                for value in values {
                    result |= self.lookup(field, value);
                }
                result
            }
        }
    }

    fn lookup(&self, field: &str, value: &FacetValue) -> RoaringTreemap {
        self.fields
            .get(field)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facets(pairs: &[(&str, FacetValue)]) -> BTreeMap<String, FacetValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn sample() -> FacetIndex {
        let mut index = FacetIndex::new();
        index.insert(1, &facets(&[("lang", "rust".into()), ("year", 2024.into())]));
        index.insert(2, &facets(&[("lang", "go".into()), ("year", 2024.into())]));
        index.insert(3, &facets(&[("lang", "rust".into()), ("year", 2023.into())]));
        index.insert(4, &facets(&[("draft", true.into())]));
        index
    }

    #[test]
    fn test_no_predicates_means_unrestricted() {
        assert!(sample().matching(&[]).is_none());
    }

    #[test]
    fn test_conjunction() {
        let index = sample();
        let hits = index
            .matching(&[
                FacetPredicate::eq("lang", "rust"),
                FacetPredicate::eq("year", 2024),
            ])
            .unwrap();
        assert_eq!(hits.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_any_of() {
        let index = sample();
        let hits = index
            .matching(&[FacetPredicate::any_of("lang", ["rust", "go"])])
            .unwrap();
        assert_eq!(hits.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_values_are_typed() {
        let index = sample();
        // The integer 2024 is not the string "2024".
        let hits = index.matching(&[FacetPredicate::eq("year", "2024")]).unwrap();
        assert!(hits.is_empty());
        let hits = index.matching(&[FacetPredicate::eq("draft", true)]).unwrap();
        assert!(hits.contains(4));
    }

    #[test]
    fn test_unknown_field_matches_nothing() {
        let hits = sample().matching(&[FacetPredicate::eq("nope", 1)]).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut index = sample();
        index.remove(1, &facets(&[("lang", "rust".into()), ("year", 2024.into())]));
        let hits = index.matching(&[FacetPredicate::eq("lang", "rust")]).unwrap();
        assert_eq!(hits.iter().collect::<Vec<_>>(), vec![3]);
        assert_eq!(index.len(), 3);

        index.remove(4, &facets(&[("draft", true.into())]));
        assert!(!index.fields.contains_key("draft"));
    }
}

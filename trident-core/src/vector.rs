//! Vector types shared by the index, the store and the embedding provider.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Unique, stable identifier of a record.
pub type VectorId = u64;

/// Immutable vector payload as held by the index's vector table.
///
/// Readers clone the `Arc`, so a search keeps the payload it started with
/// even if the vector is replaced or evicted underneath it.
pub type SharedVector = Arc<[f32]>;

/// A dense vector of floating-point values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    data: Vec<f32>,
}

impl Vector {
    /// Creates a new vector from a slice of f32 values.
    ///
    /// # Example
    ///
    /// ```
    /// use trident_core::Vector;
    ///
    /// let v = Vector::new(&[1.0, 2.0, 3.0]);
    /// assert_eq!(v.dimension(), 3);
    /// ```
    #[inline]
    pub fn new(data: &[f32]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    /// Returns the dimension (length) of the vector.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.data.len()
    }

    /// Returns a slice view of the vector data.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Computes the L2 (Euclidean) norm of the vector.
    #[inline]
    pub fn norm(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Rejects the vector unless it has exactly `expected` components.
    pub fn check(&self, expected: usize) -> Result<()> {
        check_dimension(&self.data, expected)
    }

    /// Converts into the shared form stored by the index.
    #[inline]
    pub fn into_shared(self) -> SharedVector {
        Arc::from(self.data)
    }

    /// Consumes the vector and returns the underlying data.
    #[inline]
    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }
}

/// Dimension check applied to every vector entering or querying an index.
#[inline]
pub fn check_dimension(data: &[f32], expected: usize) -> Result<()> {
    if data.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            got: data.len(),
        });
    }
    Ok(())
}

impl From<Vec<f32>> for Vector {
    fn from(data: Vec<f32>) -> Self {
        Self { data }
    }
}

impl From<&[f32]> for Vector {
    fn from(data: &[f32]) -> Self {
        Self::new(data)
    }
}

impl<const N: usize> From<[f32; N]> for Vector {
    fn from(data: [f32; N]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }
}

impl AsRef<[f32]> for Vector {
    fn as_ref(&self) -> &[f32] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_creation() {
        let v = Vector::new(&[1.0, 2.0, 3.0]);
        assert_eq!(v.dimension(), 3);
        assert_eq!(v.as_slice(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_vector_norm() {
        let v = Vector::from([3.0, 4.0]);
        assert!((v.norm() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_check_dimension() {
        let v = Vector::from(vec![1.0, 2.0]);
        assert!(v.check(2).is_ok());
        assert!(matches!(
            v.check(3),
            Err(Error::DimensionMismatch {
                expected: 3,
                got: 2
            })
        ));
    }

    #[test]
    fn test_into_shared() {
        let shared = Vector::from([0.5, 0.25]).into_shared();
        assert_eq!(&shared[..], &[0.5, 0.25]);
    }
}

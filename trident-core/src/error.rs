//! Error types for Trident operations.

use thiserror::Error;

/// Result type alias using Trident's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during Trident operations.
///
/// The type is `Clone` so that a single model-resolution failure can be
/// handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Vector length does not match the index dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Attempted to insert an id that is already live.
    #[error("duplicate vector id: {0}")]
    DuplicateId(u64),

    /// No live record with the given id.
    #[error("vector not found: {0}")]
    NotFound(u64),

    /// No local model and no permitted remote source could provide the model.
    #[error("model `{model}` unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },

    /// Cache budget override is non-positive or too small to partition.
    #[error("invalid cache budget: {0}")]
    CacheBudgetInvalid(String),

    /// Persisted index is unreadable. Rebuild it from source data.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    /// Configuration rejected at start-up.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error from the key-value store.
    #[error("io error: {0}")]
    IoError(String),

    /// Record encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true for errors that mean the caller asked about an id that
    /// does not exist, as opposed to a real failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

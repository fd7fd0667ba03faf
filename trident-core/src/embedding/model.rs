//! Model and repository seams.
//!
//! The engine never runs a neural model itself. An [`EmbeddingModel`] is any
//! function from content to a fixed-length vector, and a
//! [`ModelRepository`] is somewhere such a model can be loaded from.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Turns content into a vector.
pub trait EmbeddingModel: Send + Sync {
    /// Length of every vector this model produces.
    fn dimension(&self) -> usize;

    /// Embeds `content`. May be slow; the provider calls it on a blocking
    /// thread.
    fn embed(&self, content: &str) -> Result<Vec<f32>>;
}

/// Where a repository fetches models from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelOrigin {
    /// Already on this machine.
    Local,
    /// Downloaded on demand. Only used when the remote policy permits.
    Remote,
}

impl fmt::Display for ModelOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelOrigin::Local => f.write_str("local"),
            ModelOrigin::Remote => f.write_str("remote"),
        }
    }
}

/// A source of models.
pub trait ModelRepository: Send + Sync {
    /// Name reported in resolution attempts and errors.
    fn name(&self) -> &str;

    fn origin(&self) -> ModelOrigin;

    /// Loads the model stored under `key`.
    ///
    /// `Ok(None)` means this repository does not have it; `Err` means the
    /// repository itself failed. Either way the next repository is tried.
    /// Called on a blocking thread.
    fn load(&self, key: &str) -> Result<Option<Arc<dyn EmbeddingModel>>>;
}

/// Repository of in-process models registered up front.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trident_core::embedding::{HashingModel, ModelOrigin, ModelRepository, StaticRepository};
///
/// let repo = StaticRepository::local("bundled").with_model("tiny", Arc::new(HashingModel::new(16)));
/// assert_eq!(repo.origin(), ModelOrigin::Local);
/// assert!(repo.load("tiny").unwrap().is_some());
/// assert!(repo.load("large").unwrap().is_none());
/// ```
pub struct StaticRepository {
    name: String,
    origin: ModelOrigin,
    models: HashMap<String, Arc<dyn EmbeddingModel>>,
}

impl StaticRepository {
    pub fn new(name: impl Into<String>, origin: ModelOrigin) -> Self {
        Self {
            name: name.into(),
            origin,
            models: HashMap::new(),
        }
    }

    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, ModelOrigin::Local)
    }

    pub fn remote(name: impl Into<String>) -> Self {
        Self::new(name, ModelOrigin::Remote)
    }

    /// Registers `model` under `key`. Chainable.
    pub fn with_model(mut self, key: impl Into<String>, model: Arc<dyn EmbeddingModel>) -> Self {
        self.models.insert(key.into(), model);
        self
    }
}

impl ModelRepository for StaticRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn origin(&self) -> ModelOrigin {
        self.origin
    }

    fn load(&self, key: &str) -> Result<Option<Arc<dyn EmbeddingModel>>> {
        Ok(self.models.get(key).cloned())
    }
}

/// Loads the model found at a path.
pub type ModelLoader = dyn Fn(&Path) -> Result<Arc<dyn EmbeddingModel>> + Send + Sync;

/// Repository backed by a directory with one entry per model key
/// (`<root>/<key>`). Reading the entry is delegated to a loader function.
pub struct DirectoryRepository {
    name: String,
    origin: ModelOrigin,
    root: PathBuf,
    loader: Arc<ModelLoader>,
}

impl DirectoryRepository {
    pub fn new<F>(name: impl Into<String>, root: impl Into<PathBuf>, loader: F) -> Self
    where
        F: Fn(&Path) -> Result<Arc<dyn EmbeddingModel>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            origin: ModelOrigin::Local,
            root: root.into(),
            loader: Arc::new(loader),
        }
    }

    /// Marks the directory as a remote mount (network share, lazily
    /// synced cache) so it is subject to the remote policy.
    pub fn with_origin(mut self, origin: ModelOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModelRepository for DirectoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn origin(&self) -> ModelOrigin {
        self.origin
    }

    fn load(&self, key: &str) -> Result<Option<Arc<dyn EmbeddingModel>>> {
        let plain = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\']);
        if !plain {
            return Err(Error::InvalidConfig(format!(
                "model key `{}` is not a plain name",
                key
            )));
        }

        let path = self.root.join(key);
        if !path.exists() {
            return Ok(None);
        }
        (self.loader)(&path).map(Some)
    }
}

/// Deterministic feature-hashing model.
///
/// Tokens are hashed into buckets with FNV-1a and the bucket counts are
/// L2-normalized. Content sharing words lands close under cosine distance.
/// It carries no semantics beyond word overlap; use it for tests, demos and
/// air-gapped fallbacks.
#[derive(Debug, Clone)]
pub struct HashingModel {
    dimension: usize,
}

impl HashingModel {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Hash a term using FNV-1a.
    fn hash_term(term: &str) -> u64 {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        h
    }

    fn tokenize(content: &str) -> impl Iterator<Item = String> + '_ {
        content
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }
}

impl EmbeddingModel for HashingModel {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, content: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in Self::tokenize(content) {
            let h = Self::hash_term(&token);
            let bucket = (h % self.dimension as u64) as usize;
            // The top bit picks a sign so collisions partly cancel out.
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::cosine_distance;

    #[test]
    fn test_hashing_model_is_deterministic() {
        let model = HashingModel::new(64);
        let a = model.embed("graph search engine").unwrap();
        let b = model.embed("Graph, search; ENGINE!").unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hashing_model_word_overlap() {
        let model = HashingModel::new(256);
        let base = model.embed("rust vector index").unwrap();
        let near = model.embed("rust vector database").unwrap();
        let far = model.embed("chocolate cake recipe").unwrap();
        assert!(cosine_distance(&base, &near) < cosine_distance(&base, &far));
    }

    #[test]
    fn test_hashing_model_empty_content() {
        let v = HashingModel::new(8).embed("   ").unwrap();
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_directory_repository() {
        let root = std::env::temp_dir().join(format!("trident_models_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("mini")).unwrap();

        let repo = DirectoryRepository::new("models-dir", &root, |_path| {
            Ok(Arc::new(HashingModel::new(12)) as Arc<dyn EmbeddingModel>)
        });
        assert_eq!(repo.origin(), ModelOrigin::Local);

        let model = repo.load("mini").unwrap().unwrap();
        assert_eq!(model.dimension(), 12);
        assert!(repo.load("missing").unwrap().is_none());
        assert!(repo.load("../mini").is_err());

        let _ = std::fs::remove_dir_all(&root);
    }
}

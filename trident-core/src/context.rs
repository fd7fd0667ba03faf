//! Process-wide engine context.
//!
//! Everything stores share (the cache manager, the key-value store and the
//! optional embedding provider) is built once here and handed to each
//! [`UnifiedStore`](crate::store::UnifiedStore) explicitly. Stores on one
//! context keep their keys apart by store name, and a name can be open only
//! once per context at a time.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{BudgetDetector, CacheManager, DEFAULT_MEMORY_FRACTION};
use crate::config::EngineConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::storage::{KvStore, MemoryKvStore};

/// Shared services for stores.
///
/// # Example
///
/// ```
/// use trident_core::{EngineConfig, EngineContext};
///
/// let config = EngineConfig::new(8).with_cache_budget_bytes(1 << 20);
/// let ctx = EngineContext::from_config(&config).unwrap();
/// assert_eq!(ctx.cache().budget().total_bytes(), 1 << 20);
/// assert!(ctx.embedder().is_none());
/// ```
#[derive(Clone)]
pub struct EngineContext {
    cache: Arc<CacheManager>,
    kv: Arc<dyn KvStore>,
    embedder: Option<Arc<EmbeddingProvider>>,
    open_stores: Arc<Mutex<HashSet<String>>>,
}

/// Held by an open store; releases its name when dropped.
#[derive(Debug)]
pub(crate) struct StoreClaim {
    name: String,
    open_stores: Arc<Mutex<HashSet<String>>>,
}

impl Drop for StoreClaim {
    fn drop(&mut self) {
        self.open_stores.lock().remove(&self.name);
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("cache", &self.cache)
            .field("persistent", &self.kv.is_persistent())
            .field("embedder", &self.embedder.is_some())
            .finish()
    }
}

impl EngineContext {
    pub fn builder() -> EngineContextBuilder {
        EngineContextBuilder::default()
    }

    /// Builds a context from `config`: detects the cache budget with the
    /// system probe chain and the config's fraction and override, and uses
    /// an in-memory key-value store without an embedding provider.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::builder()
            .memory_fraction(config.memory_fraction)
            .cache_budget_override(config.cache_budget_bytes)
            .build()
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn kv_store(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn embedder(&self) -> Option<&Arc<EmbeddingProvider>> {
        self.embedder.as_ref()
    }

    /// Names of the stores currently open on this context.
    pub fn open_stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.open_stores.lock().iter().cloned().collect();
        names.sort();
        names
    }

    /// Reserves `name` for one store. Fails if a store of that name is
    /// already open on this context, since both would own the same keys.
    pub(crate) fn claim_store(&self, name: &str) -> Result<StoreClaim> {
        let mut open = self.open_stores.lock();
        if !open.insert(name.to_string()) {
            return Err(Error::InvalidConfig(format!(
                "store `{}` is already open on this context",
                name
            )));
        }
        Ok(StoreClaim {
            name: name.to_string(),
            open_stores: Arc::clone(&self.open_stores),
        })
    }
}

/// Builder for [`EngineContext`].
#[derive(Default)]
pub struct EngineContextBuilder {
    cache: Option<Arc<CacheManager>>,
    detector: Option<BudgetDetector>,
    memory_fraction: Option<f64>,
    budget_override: Option<i64>,
    kv: Option<Arc<dyn KvStore>>,
    embedder: Option<Arc<EmbeddingProvider>>,
}

impl EngineContextBuilder {
    /// Uses an existing cache manager. Detection settings are then ignored.
    pub fn cache_manager(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replaces the system probe chain.
    pub fn budget_detector(mut self, detector: BudgetDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Fraction of free memory used by the default detector.
    pub fn memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = Some(fraction);
        self
    }

    /// Explicit cache budget in bytes, skipping detection.
    pub fn cache_budget_override(mut self, bytes: Option<i64>) -> Self {
        self.budget_override = bytes;
        self
    }

    pub fn kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn embedder(mut self, embedder: Arc<EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn build(self) -> Result<EngineContext> {
        let cache = match self.cache {
            Some(cache) => cache,
            None => {
                let detector = match self.detector {
                    Some(detector) => detector,
                    None => BudgetDetector::system(
                        self.memory_fraction.unwrap_or(DEFAULT_MEMORY_FRACTION),
                    )?,
                };
                Arc::new(CacheManager::detect(&detector, self.budget_override)?)
            }
        };
        let kv = self
            .kv
            .unwrap_or_else(|| Arc::new(MemoryKvStore::new()) as Arc<dyn KvStore>);

        let budget = cache.budget();
        tracing::info!(
            budget_bytes = budget.total_bytes(),
            source = ?budget.source(),
            persistent = kv.is_persistent(),
            embedder = self.embedder.is_some(),
            "engine context ready"
        );

        Ok(EngineContext {
            cache,
            kv,
            embedder: self.embedder,
            open_stores: Arc::default(),
        })
    }
}

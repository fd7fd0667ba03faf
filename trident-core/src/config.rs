//! Engine configuration.
//!
//! [`EngineConfig`] is plain serde data: build it in code with the `with_*`
//! setters, or load it from JSON. Environment overrides are applied
//! explicitly with [`EngineConfig::apply_env`], never implicitly on load.

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_MEMORY_FRACTION;
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::index::HnswConfig;
use crate::storage::Keyspace;

/// Disables remote model repositories when set to a true value.
pub const ENV_OFFLINE: &str = "TRIDENT_OFFLINE";
/// Overrides the detected cache budget, in bytes.
pub const ENV_CACHE_BUDGET_BYTES: &str = "TRIDENT_CACHE_BUDGET_BYTES";
/// Permits remote model repositories unless configured otherwise.
pub const ENV_ALLOW_REMOTE_MODELS: &str = "TRIDENT_ALLOW_REMOTE_MODELS";

/// Where the index keeps vector payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorResidency {
    /// Paged when the key-value store is persistent, resident otherwise.
    #[default]
    Auto,
    /// Every vector stays in memory.
    Resident,
    /// Vectors live in the key-value store and are cached in the
    /// index-layer region.
    Paged,
}

fn default_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    100
}
fn default_ef_search() -> usize {
    50
}
fn default_seed() -> u64 {
    HnswConfig::DEFAULT_SEED
}
fn default_memory_fraction() -> f64 {
    DEFAULT_MEMORY_FRACTION
}
fn default_store_name() -> String {
    "default".to_string()
}
fn default_model() -> String {
    "default".to_string()
}
fn default_oversample() -> usize {
    4
}
fn default_max_expansion_rounds() -> usize {
    3
}
fn default_exact_scan_threshold() -> usize {
    256
}
fn default_compaction_ratio() -> f64 {
    0.3
}

/// Configuration for an engine instance.
///
/// # Example
///
/// ```
/// use trident_core::{DistanceMetric, EngineConfig};
///
/// let config = EngineConfig::from_json_str(r#"{ "dimension": 384, "metric": "euclidean" }"#).unwrap();
/// assert_eq!(config.metric, DistanceMetric::Euclidean);
/// assert_eq!(config.hnsw().m_max0, 32);
///
/// let config = EngineConfig::new(3).with_m(8).with_offline_mode(true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Length of every vector. Required.
    pub dimension: usize,
    /// Namespace of the store's keys in the shared key-value store.
    #[serde(default = "default_store_name")]
    pub store_name: String,
    #[serde(default)]
    pub metric: DistanceMetric,
    /// Neighbor bound on layers above 0.
    #[serde(default = "default_m")]
    pub m: usize,
    /// Neighbor bound on layer 0. Defaults to `2 * m`.
    #[serde(default)]
    pub m_max0: Option<usize>,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// Level assignment multiplier. Defaults to `1 / ln(m)`.
    #[serde(default)]
    pub level_multiplier: Option<f64>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Explicit cache budget. Signed so that a bad value can be reported
    /// instead of wrapping.
    #[serde(default)]
    pub cache_budget_bytes: Option<i64>,
    #[serde(default = "default_memory_fraction")]
    pub memory_fraction: f64,
    /// Unset means "defer to the environment".
    #[serde(default)]
    pub allow_remote_models: Option<bool>,
    #[serde(default)]
    pub offline_mode: bool,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Candidates fetched per requested result in filtered queries.
    #[serde(default = "default_oversample")]
    pub oversample: usize,
    #[serde(default = "default_max_expansion_rounds")]
    pub max_expansion_rounds: usize,
    /// Allowed sets at or below this size are ranked exactly.
    #[serde(default = "default_exact_scan_threshold")]
    pub exact_scan_threshold: usize,
    /// Tombstone ratio that triggers compaction after a delete.
    #[serde(default = "default_compaction_ratio")]
    pub compaction_ratio: f64,
    #[serde(default)]
    pub vector_residency: VectorResidency,
}

impl EngineConfig {
    /// Creates a config with defaults for everything but the dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            store_name: default_store_name(),
            metric: DistanceMetric::default(),
            m: default_m(),
            m_max0: None,
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            level_multiplier: None,
            seed: default_seed(),
            cache_budget_bytes: None,
            memory_fraction: default_memory_fraction(),
            allow_remote_models: None,
            offline_mode: false,
            default_model: default_model(),
            oversample: default_oversample(),
            max_expansion_rounds: default_max_expansion_rounds(),
            exact_scan_threshold: default_exact_scan_threshold(),
            compaction_ratio: default_compaction_ratio(),
            vector_residency: VectorResidency::default(),
        }
    }

    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("config parse failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    pub fn with_m_max0(mut self, m_max0: usize) -> Self {
        self.m_max0 = Some(m_max0);
        self
    }

    pub fn with_ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_cache_budget_bytes(mut self, bytes: i64) -> Self {
        self.cache_budget_bytes = Some(bytes);
        self
    }

    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction;
        self
    }

    pub fn with_allow_remote_models(mut self, allow: bool) -> Self {
        self.allow_remote_models = Some(allow);
        self
    }

    pub fn with_offline_mode(mut self, offline: bool) -> Self {
        self.offline_mode = offline;
        self
    }

    pub fn with_default_model(mut self, key: impl Into<String>) -> Self {
        self.default_model = key.into();
        self
    }

    pub fn with_oversample(mut self, oversample: usize) -> Self {
        self.oversample = oversample;
        self
    }

    pub fn with_max_expansion_rounds(mut self, rounds: usize) -> Self {
        self.max_expansion_rounds = rounds;
        self
    }

    pub fn with_exact_scan_threshold(mut self, threshold: usize) -> Self {
        self.exact_scan_threshold = threshold;
        self
    }

    pub fn with_compaction_ratio(mut self, ratio: f64) -> Self {
        self.compaction_ratio = ratio;
        self
    }

    pub fn with_vector_residency(mut self, residency: VectorResidency) -> Self {
        self.vector_residency = residency;
        self
    }

    /// Applies `TRIDENT_OFFLINE` and `TRIDENT_CACHE_BUDGET_BYTES` from the
    /// process environment.
    ///
    /// `TRIDENT_ALLOW_REMOTE_MODELS` is not folded in here; the remote
    /// policy consults it itself so it can report which source decided.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Same as [`apply_env`](Self::apply_env) with a custom variable lookup.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_OFFLINE) {
            match parse_flag(&raw) {
                Some(offline) => self.offline_mode = offline,
                None => tracing::warn!(
                    variable = ENV_OFFLINE,
                    value = %raw,
                    "ignoring unrecognised flag value"
                ),
            }
        }

        if let Some(raw) = lookup(ENV_CACHE_BUDGET_BYTES) {
            let bytes = raw.trim().parse::<i64>().map_err(|e| {
                Error::InvalidConfig(format!(
                    "{} must be an integer byte count, got `{}`: {}",
                    ENV_CACHE_BUDGET_BYTES, raw, e
                ))
            })?;
            self.cache_budget_bytes = Some(bytes);
        }

        Ok(self)
    }

    /// The layer-0 neighbor bound after defaults.
    pub fn effective_m_max0(&self) -> usize {
        self.m_max0.unwrap_or(self.m * 2)
    }

    /// Index parameters derived from this config.
    pub fn hnsw(&self) -> HnswConfig {
        HnswConfig {
            m: self.m,
            m_max0: self.effective_m_max0(),
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
            level_multiplier: self
                .level_multiplier
                .unwrap_or_else(|| HnswConfig::default_level_multiplier(self.m)),
            seed: self.seed,
        }
    }

    /// Checks every field that has a constrained range.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(Error::InvalidConfig("dimension must be positive".into()));
        }
        Keyspace::new(self.store_name.as_str())?;
        self.hnsw().validate()?;
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "memory_fraction must be in (0, 1], got {}",
                self.memory_fraction
            )));
        }
        if self.default_model.trim().is_empty() {
            return Err(Error::InvalidConfig("default_model must not be empty".into()));
        }
        if self.oversample == 0 {
            return Err(Error::InvalidConfig("oversample must be at least 1".into()));
        }
        if !(self.compaction_ratio > 0.0 && self.compaction_ratio <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "compaction_ratio must be in (0, 1], got {}",
                self.compaction_ratio
            )));
        }
        Ok(())
    }
}

/// Parses the usual spellings of a boolean environment flag.
pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

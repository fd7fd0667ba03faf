//! Memory budget detection.
//!
//! Hosts differ in what they reveal about their memory: a server process can
//! ask the OS, a sandbox or worker thread may get nothing back. Detection
//! therefore runs an ordered chain of [`MemoryProbe`]s and falls back to a
//! conservative assumption when every probe comes back empty. The outcome
//! records which step produced the number.

use crate::cache::{CacheBudget, DEFAULT_MEMORY_FRACTION};
use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Total memory assumed when no probe answers.
pub const CONSERVATIVE_TOTAL_BYTES: u64 = 8 * GIB;
/// Free memory assumed when no probe answers.
pub const CONSERVATIVE_FREE_BYTES: u64 = 4 * GIB;
/// Detected budgets are never smaller than this.
pub const MIN_DETECTED_BUDGET_BYTES: u64 = 16 * MIB;

/// Memory figures reported by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Where a cache budget came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetSource {
    /// Caller supplied the total explicitly.
    Override,
    /// A probe reported the host's memory.
    Probe {
        name: String,
        total_bytes: u64,
        free_bytes: u64,
    },
    /// No probe answered; the conservative assumption was used.
    ConservativeDefault { failed_probes: Vec<String> },
    /// Set by [`CacheManager::resize`](crate::cache::CacheManager::resize).
    Resized,
}

/// A way of asking the host how much memory it has.
pub trait MemoryProbe: Send + Sync {
    /// Short name recorded in [`BudgetSource::Probe`].
    fn name(&self) -> &str;

    /// Returns `None` when this host does not expose the information.
    fn probe(&self) -> Option<MemorySnapshot>;
}

/// Queries the operating system through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    fn name(&self) -> &str {
        "system"
    }

    fn probe(&self) -> Option<MemorySnapshot> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return None;
        }

        let mut system = sysinfo::System::new();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        let free = match system.available_memory() {
            0 => system.free_memory(),
            available => available,
        };

        Some(MemorySnapshot {
            total_bytes: total,
            free_bytes: free.min(total),
        })
    }
}

/// A probe returning fixed figures.
///
/// For hosts that are told their limits out of band (a worker given a heap
/// size, a container with a known quota).
#[derive(Debug, Clone)]
pub struct StaticMemoryProbe {
    name: String,
    snapshot: Option<MemorySnapshot>,
}

impl StaticMemoryProbe {
    pub fn new(name: impl Into<String>, total_bytes: u64, free_bytes: u64) -> Self {
        Self {
            name: name.into(),
            snapshot: Some(MemorySnapshot {
                total_bytes,
                free_bytes: free_bytes.min(total_bytes),
            }),
        }
    }

    /// A probe that never answers.
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshot: None,
        }
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> Option<MemorySnapshot> {
        self.snapshot.filter(|s| s.total_bytes > 0)
    }
}

/// Runs a probe chain and turns the first answer into a [`CacheBudget`].
///
/// # Example
///
/// ```
/// use trident_core::cache::{BudgetDetector, BudgetSource, StaticMemoryProbe};
///
/// let detector = BudgetDetector::new(0.25)
///     .unwrap()
///     .with_probe(StaticMemoryProbe::new("quota", 2 << 30, 1 << 30));
///
/// let budget = detector.detect(None).unwrap();
/// assert_eq!(budget.total_bytes(), 256 << 20);
/// assert!(matches!(budget.source(), BudgetSource::Probe { .. }));
/// ```
pub struct BudgetDetector {
    probes: Vec<Box<dyn MemoryProbe>>,
    memory_fraction: f64,
}

impl std::fmt::Debug for BudgetDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetDetector")
            .field(
                "probes",
                &self.probes.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("memory_fraction", &self.memory_fraction)
            .finish()
    }
}

impl BudgetDetector {
    /// Creates a detector with an empty probe chain.
    ///
    /// `memory_fraction` is the share of free memory given to caches and
    /// must lie in `(0, 1]`.
    pub fn new(memory_fraction: f64) -> Result<Self> {
        if !(memory_fraction > 0.0 && memory_fraction <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "memory_fraction must be in (0, 1], got {}",
                memory_fraction
            )));
        }
        Ok(Self {
            probes: Vec::new(),
            memory_fraction,
        })
    }

    /// The default chain: the `sysinfo` system probe.
    pub fn system(memory_fraction: f64) -> Result<Self> {
        Ok(Self::new(memory_fraction)?.with_probe(SystemMemoryProbe))
    }

    /// Appends a probe to the chain.
    pub fn with_probe(mut self, probe: impl MemoryProbe + 'static) -> Self {
        self.probes.push(Box::new(probe));
        self
    }

    /// Names of the probes, in the order they run.
    pub fn probe_names(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    /// Computes a budget.
    ///
    /// An explicit override is used verbatim and must be positive and large
    /// enough to give every partition its minimum. Otherwise the first probe
    /// to answer wins; if none does, the conservative defaults apply.
    pub fn detect(&self, explicit_override: Option<i64>) -> Result<CacheBudget> {
        if let Some(requested) = explicit_override {
            if requested <= 0 {
                return Err(Error::CacheBudgetInvalid(format!(
                    "override must be positive, got {}",
                    requested
                )));
            }
            let budget = CacheBudget::partitioned(requested as u64, BudgetSource::Override)?;
            tracing::info!(total_bytes = budget.total_bytes(), "cache budget from override");
            return Ok(budget);
        }

        let mut failed = Vec::new();
        for probe in &self.probes {
            match probe.probe() {
                Some(snapshot) => {
                    let total = self.budget_from_free(snapshot.free_bytes);
                    tracing::info!(
                        probe = probe.name(),
                        host_total = snapshot.total_bytes,
                        host_free = snapshot.free_bytes,
                        total_bytes = total,
                        "cache budget detected"
                    );
                    return CacheBudget::partitioned(
                        total,
                        BudgetSource::Probe {
                            name: probe.name().to_string(),
                            total_bytes: snapshot.total_bytes,
                            free_bytes: snapshot.free_bytes,
                        },
                    );
                }
                None => {
                    tracing::debug!(probe = probe.name(), "memory probe unavailable");
                    failed.push(probe.name().to_string());
                }
            }
        }

        let total = self.budget_from_free(CONSERVATIVE_FREE_BYTES);
        tracing::warn!(
            failed_probes = ?failed,
            assumed_total = CONSERVATIVE_TOTAL_BYTES,
            assumed_free = CONSERVATIVE_FREE_BYTES,
            total_bytes = total,
            "no memory probe answered, using conservative cache budget"
        );
        CacheBudget::partitioned(
            total,
            BudgetSource::ConservativeDefault {
                failed_probes: failed,
            },
        )
    }

    fn budget_from_free(&self, free_bytes: u64) -> u64 {
        let share = (free_bytes as f64 * self.memory_fraction) as u64;
        share.max(MIN_DETECTED_BUDGET_BYTES)
    }
}

/// Detects a budget with the system probe and the default memory fraction.
///
/// ```
/// use trident_core::cache::detect_optimal_cache_size;
///
/// let budget = detect_optimal_cache_size(Some(64 << 20)).unwrap();
/// assert_eq!(budget.total_bytes(), 64 << 20);
/// assert!(detect_optimal_cache_size(Some(0)).is_err());
/// ```
pub fn detect_optimal_cache_size(explicit_override: Option<i64>) -> Result<CacheBudget> {
    BudgetDetector::system(DEFAULT_MEMORY_FRACTION)?.detect(explicit_override)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RegionKind;

    #[test]
    fn test_override_is_used_verbatim() {
        let detector = BudgetDetector::new(0.25).unwrap();
        let budget = detector.detect(Some(10 * MIB as i64)).unwrap();
        assert_eq!(budget.total_bytes(), 10 * MIB);
        assert_eq!(budget.source(), &BudgetSource::Override);
    }

    #[test]
    fn test_non_positive_override_rejected() {
        let detector = BudgetDetector::new(0.25).unwrap();
        assert!(matches!(
            detector.detect(Some(0)),
            Err(Error::CacheBudgetInvalid(_))
        ));
        assert!(matches!(
            detector.detect(Some(-5)),
            Err(Error::CacheBudgetInvalid(_))
        ));
    }

    #[test]
    fn test_override_too_small_for_partitions() {
        let detector = BudgetDetector::new(0.25).unwrap();
        assert!(matches!(
            detector.detect(Some(1024)),
            Err(Error::CacheBudgetInvalid(_))
        ));
    }

    #[test]
    fn test_first_answering_probe_wins() {
        let detector = BudgetDetector::new(0.5)
            .unwrap()
            .with_probe(StaticMemoryProbe::unavailable("cgroup"))
            .with_probe(StaticMemoryProbe::new("quota", 4 * GIB, 2 * GIB))
            .with_probe(StaticMemoryProbe::new("never", 64 * GIB, 64 * GIB));

        let budget = detector.detect(None).unwrap();
        assert_eq!(budget.total_bytes(), GIB);
        match budget.source() {
            BudgetSource::Probe { name, .. } => assert_eq!(name, "quota"),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_conservative_default_when_probes_fail() {
        let detector = BudgetDetector::new(0.25)
            .unwrap()
            .with_probe(StaticMemoryProbe::unavailable("sandbox"));

        let budget = detector.detect(None).unwrap();
        assert_eq!(budget.total_bytes(), GIB);
        assert_eq!(
            budget.source(),
            &BudgetSource::ConservativeDefault {
                failed_probes: vec!["sandbox".to_string()]
            }
        );
        let sum: u64 = budget.partitions().iter().map(|p| p.bytes).sum();
        assert_eq!(sum, budget.total_bytes());
        assert!(budget.partition_bytes(RegionKind::QueryResult) > 0);
    }

    #[test]
    fn test_small_hosts_get_floor() {
        let detector = BudgetDetector::new(0.25)
            .unwrap()
            .with_probe(StaticMemoryProbe::new("tiny", 32 * MIB, MIB));
        let budget = detector.detect(None).unwrap();
        assert_eq!(budget.total_bytes(), MIN_DETECTED_BUDGET_BYTES);
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        assert!(BudgetDetector::new(0.0).is_err());
        assert!(BudgetDetector::new(1.5).is_err());
        assert!(BudgetDetector::new(f64::NAN).is_err());
    }

    #[test]
    fn test_system_detection_never_zero() {
        let budget = detect_optimal_cache_size(None).unwrap();
        assert!(budget.total_bytes() >= MIN_DETECTED_BUDGET_BYTES);
    }
}

//! Embedding provider.
//!
//! [`EmbeddingProvider`] turns content into vectors. Models are resolved by
//! key, once per process: local repositories first, then remote ones if the
//! [`RemotePolicy`] permits. Concurrent requests for a key that is still
//! resolving wait for the same resolution instead of starting their own,
//! and every waiter receives the same success or failure.
//!
//! Outcomes are cached, failures included, until
//! [`EmbeddingProvider::reconfigure`] is called.

pub mod model;
pub mod policy;

pub use model::{
    DirectoryRepository, EmbeddingModel, HashingModel, ModelLoader, ModelOrigin, ModelRepository,
    StaticRepository,
};
pub use policy::{PolicySource, RemotePolicy};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::vector::check_dimension;

/// Resolution state of a model key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Unresolved,
    Resolving,
    Available,
    Failed,
}

/// What happened when one repository was asked for a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Found,
    Missing,
    Failed(String),
    /// Remote repository skipped because the policy denies remote use.
    Skipped,
}

/// One repository consulted during a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionAttempt {
    pub repository: String,
    pub origin: ModelOrigin,
    pub outcome: AttemptOutcome,
}

/// Inspectable record of how a model key was sourced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    pub key: String,
    pub status: ModelStatus,
    pub origin: Option<ModelOrigin>,
    pub repository: Option<String>,
    pub dimension: Option<usize>,
    pub failure: Option<String>,
    pub attempts: Vec<ResolutionAttempt>,
}

#[derive(Clone)]
struct Resolved {
    model: Arc<dyn EmbeddingModel>,
    origin: ModelOrigin,
    repository: String,
}

#[derive(Clone)]
struct Resolution {
    outcome: Result<Resolved>,
    attempts: Vec<ResolutionAttempt>,
}

enum Slot {
    /// In flight, tagged with a flight number unique within the provider.
    Resolving(u64, watch::Receiver<Option<Resolution>>),
    Done(Resolution),
}

#[derive(Default)]
struct Slots {
    /// Bumped by `reconfigure`; results of older resolutions are not cached.
    generation: u64,
    next_flight: u64,
    entries: HashMap<String, Slot>,
}

/// Sources embedding models and embeds content with them.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trident_core::embedding::{EmbeddingProvider, HashingModel, StaticRepository};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let provider = EmbeddingProvider::new(32)
///     .with_default_model("words")
///     .with_local(StaticRepository::local("bundled").with_model("words", Arc::new(HashingModel::new(32))));
///
/// let vector = provider.embed("hello world").await.unwrap();
/// assert_eq!(vector.len(), 32);
/// # });
/// ```
pub struct EmbeddingProvider {
    dimension: usize,
    default_model: String,
    local: Vec<Arc<dyn ModelRepository>>,
    remote: Vec<Arc<dyn ModelRepository>>,
    policy: RwLock<RemotePolicy>,
    slots: Arc<Mutex<Slots>>,
    fetches: Arc<AtomicUsize>,
}

impl std::fmt::Debug for EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingProvider")
            .field("dimension", &self.dimension)
            .field("default_model", &self.default_model)
            .field("local", &self.local.iter().map(|r| r.name()).collect::<Vec<_>>())
            .field("remote", &self.remote.iter().map(|r| r.name()).collect::<Vec<_>>())
            .field("policy", &*self.policy.read())
            .finish()
    }
}

impl EmbeddingProvider {
    /// Creates a provider for models producing `dimension`-length vectors.
    /// Remote repositories are denied until a policy says otherwise.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            default_model: "default".to_string(),
            local: Vec::new(),
            remote: Vec::new(),
            policy: RwLock::new(RemotePolicy::default()),
            slots: Arc::new(Mutex::new(Slots::default())),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a provider using the dimension, default model and remote
    /// policy of `config` (the policy also consults the environment).
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.dimension)
            .with_default_model(config.default_model.clone())
            .with_policy(RemotePolicy::from_config(config))
    }

    pub fn with_default_model(mut self, key: impl Into<String>) -> Self {
        self.default_model = key.into();
        self
    }

    pub fn with_policy(self, policy: RemotePolicy) -> Self {
        *self.policy.write() = policy;
        self
    }

    /// Adds a repository. Local and remote repositories are each tried in
    /// the order they were added.
    pub fn with_repository(mut self, repository: Arc<dyn ModelRepository>) -> Self {
        match repository.origin() {
            ModelOrigin::Local => self.local.push(repository),
            ModelOrigin::Remote => self.remote.push(repository),
        }
        self
    }

    pub fn with_local(self, repository: impl ModelRepository + 'static) -> Self {
        self.with_repository(Arc::new(repository))
    }

    pub fn with_remote(self, repository: impl ModelRepository + 'static) -> Self {
        self.with_repository(Arc::new(repository))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn policy(&self) -> RemotePolicy {
        *self.policy.read()
    }

    /// Number of resolutions started since creation.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Acquire)
    }

    /// Resolves the default model now so configuration errors surface at
    /// start-up rather than on the first query.
    pub async fn initialize(&self) -> Result<()> {
        let key = self.default_model.clone();
        let resolved = self.resolve(&key).await?;
        tracing::info!(
            model = %key,
            origin = %resolved.origin,
            repository = %resolved.repository,
            "embedding model ready"
        );
        Ok(())
    }

    /// Embeds `content` with the default model.
    pub async fn embed(&self, content: &str) -> Result<Vec<f32>> {
        let key = self.default_model.clone();
        self.embed_with(&key, content).await
    }

    /// Embeds `content` with the model stored under `model_key`.
    pub async fn embed_with(&self, model_key: &str, content: &str) -> Result<Vec<f32>> {
        let resolved = self.resolve(model_key).await?;
        let model = Arc::clone(&resolved.model);
        let content = content.to_string();
        let vector = tokio::task::spawn_blocking(move || model.embed(&content))
            .await
            .map_err(|e| Error::ModelUnavailable {
                model: model_key.to_string(),
                reason: format!("embedding task failed: {}", e),
            })??;
        check_dimension(&vector, self.dimension)?;
        Ok(vector)
    }

    /// Replaces the remote policy and forgets every cached outcome, so the
    /// next request for any key resolves it again. Resolutions already in
    /// flight still answer their waiters but are not cached.
    pub fn reconfigure(&self, policy: RemotePolicy) {
        *self.policy.write() = policy;
        let mut slots = self.slots.lock();
        slots.generation += 1;
        slots.entries.clear();
        tracing::info!(
            allow_remote = policy.allow_remote,
            decided_by = %policy.decided_by,
            "embedding provider reconfigured"
        );
    }

    /// Current resolution state of `key`.
    pub fn source(&self, key: &str) -> ModelSource {
        let mut source = ModelSource {
            key: key.to_string(),
            status: ModelStatus::Unresolved,
            origin: None,
            repository: None,
            dimension: None,
            failure: None,
            attempts: Vec::new(),
        };

        let slots = self.slots.lock();
        match slots.entries.get(key) {
            None => {}
            Some(Slot::Resolving(..)) => source.status = ModelStatus::Resolving,
            Some(Slot::Done(resolution)) => {
                source.attempts = resolution.attempts.clone();
                match &resolution.outcome {
                    Ok(resolved) => {
                        source.status = ModelStatus::Available;
                        source.origin = Some(resolved.origin);
                        source.repository = Some(resolved.repository.clone());
                        source.dimension = Some(resolved.model.dimension());
                    }
                    Err(e) => {
                        source.status = ModelStatus::Failed;
                        source.failure = Some(e.to_string());
                    }
                }
            }
        }
        source
    }

    /// Returns the model for `key`, starting a resolution if none is cached
    /// or in flight.
    async fn resolve(&self, key: &str) -> Result<Resolved> {
        let mut retried = false;
        loop {
            let (flight, mut rx) = {
                let mut slots = self.slots.lock();
                match slots.entries.get(key) {
                    Some(Slot::Done(resolution)) => return resolution.outcome.clone(),
                    Some(Slot::Resolving(flight, rx)) => (*flight, rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        slots.next_flight += 1;
                        let flight = slots.next_flight;
                        slots
                            .entries
                            .insert(key.to_string(), Slot::Resolving(flight, rx.clone()));
                        let generation = slots.generation;
                        self.spawn_resolution(key.to_string(), generation, tx);
                        (flight, rx)
                    }
                }
            };

            let finished = match rx.wait_for(Option::is_some).await {
                Ok(value) => value.clone(),
                Err(_) => None,
            };
            if let Some(resolution) = finished {
                return resolution.outcome;
            }

            // The sender is gone without a result. Forget that flight so the
            // key does not stay stuck in `Resolving`.
            {
                let mut slots = self.slots.lock();
                let stale = matches!(
                    slots.entries.get(key),
                    Some(Slot::Resolving(current, _)) if *current == flight
                );
                if stale {
                    slots.entries.remove(key);
                }
            }
            if retried {
                return Err(Error::ModelUnavailable {
                    model: key.to_string(),
                    reason: "resolution ended without a result".to_string(),
                });
            }
            tracing::warn!(model = key, "model resolution ended without a result, retrying");
            retried = true;
        }
    }

    /// Runs the repository chain on a detached task so that a caller
    /// giving up does not cancel the resolution for everyone else.
    fn spawn_resolution(
        &self,
        key: String,
        generation: u64,
        tx: watch::Sender<Option<Resolution>>,
    ) {
        let local = self.local.clone();
        let remote = self.remote.clone();
        let policy = *self.policy.read();
        let dimension = self.dimension;
        let slots = Arc::clone(&self.slots);
        self.fetches.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let chain_key = key.clone();
            let resolution = tokio::task::spawn_blocking(move || {
                run_chain(&chain_key, dimension, &local, &remote, policy)
            })
            .await
            .unwrap_or_else(|e| Resolution {
                outcome: Err(Error::ModelUnavailable {
                    model: key.clone(),
                    reason: format!("resolution task failed: {}", e),
                }),
                attempts: Vec::new(),
            });

            {
                let mut slots = slots.lock();
                if slots.generation == generation {
                    slots
                        .entries
                        .insert(key, Slot::Done(resolution.clone()));
                }
            }
            // Waiters may all have gone; the outcome is cached regardless.
            let _ = tx.send(Some(resolution));
        });
    }
}

/// Tries local repositories, then remote ones if permitted.
fn run_chain(
    key: &str,
    dimension: usize,
    local: &[Arc<dyn ModelRepository>],
    remote: &[Arc<dyn ModelRepository>],
    policy: RemotePolicy,
) -> Resolution {
    let mut attempts = Vec::new();

    for repository in local {
        if let Some(outcome) = try_repository(key, dimension, repository.as_ref(), &mut attempts) {
            return Resolution { outcome, attempts };
        }
    }

    if policy.allow_remote {
        for repository in remote {
            tracing::info!(
                model = key,
                repository = repository.name(),
                "model not found locally, trying remote repository"
            );
            if let Some(outcome) =
                try_repository(key, dimension, repository.as_ref(), &mut attempts)
            {
                return Resolution { outcome, attempts };
            }
        }
    } else {
        for repository in remote {
            attempts.push(ResolutionAttempt {
                repository: repository.name().to_string(),
                origin: ModelOrigin::Remote,
                outcome: AttemptOutcome::Skipped,
            });
        }
    }

    let tried = if attempts.is_empty() {
        "no repositories are configured".to_string()
    } else {
        let names: Vec<String> = attempts
            .iter()
            .map(|a| format!("{} ({})", a.repository, a.origin))
            .collect();
        format!("tried {}", names.join(", "))
    };
    let remedy = if policy.allow_remote {
        "no repository provides it".to_string()
    } else {
        format!(
            "remote repositories are disabled by {}; set allow_remote_models = true \
             or TRIDENT_ALLOW_REMOTE_MODELS=1 with offline_mode = false",
            policy.decided_by
        )
    };
    let reason = format!("{}; {}", tried, remedy);
    tracing::warn!(model = key, reason = %reason, "model resolution failed");

    Resolution {
        outcome: Err(Error::ModelUnavailable {
            model: key.to_string(),
            reason,
        }),
        attempts,
    }
}

/// Asks one repository. Returns `Some` when the chain should stop.
fn try_repository(
    key: &str,
    dimension: usize,
    repository: &dyn ModelRepository,
    attempts: &mut Vec<ResolutionAttempt>,
) -> Option<Result<Resolved>> {
    let mut record = |outcome| {
        attempts.push(ResolutionAttempt {
            repository: repository.name().to_string(),
            origin: repository.origin(),
            outcome,
        })
    };

    match repository.load(key) {
        Ok(Some(model)) => {
            record(AttemptOutcome::Found);
            if model.dimension() != dimension {
                return Some(Err(Error::InvalidConfig(format!(
                    "model `{}` from `{}` produces {}-dimensional vectors but the index expects {}",
                    key,
                    repository.name(),
                    model.dimension(),
                    dimension
                ))));
            }
            tracing::debug!(
                model = key,
                repository = repository.name(),
                origin = %repository.origin(),
                "model resolved"
            );
            Some(Ok(Resolved {
                model,
                origin: repository.origin(),
                repository: repository.name().to_string(),
            }))
        }
        Ok(None) => {
            record(AttemptOutcome::Missing);
            None
        }
        Err(e) => {
            tracing::warn!(
                model = key,
                repository = repository.name(),
                error = %e,
                "repository failed, trying next"
            );
            record(AttemptOutcome::Failed(e.to_string()));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Repository that counts loads and can be slowed down.
    struct CountingRepository {
        name: &'static str,
        origin: ModelOrigin,
        model: Option<Arc<dyn EmbeddingModel>>,
        delay: Duration,
        loads: Arc<AtomicUsize>,
    }

    impl CountingRepository {
        fn new(name: &'static str, origin: ModelOrigin, dimension: Option<usize>) -> Self {
            Self {
                name,
                origin,
                model: dimension
                    .map(|d| Arc::new(HashingModel::new(d)) as Arc<dyn EmbeddingModel>),
                delay: Duration::ZERO,
                loads: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl ModelRepository for CountingRepository {
        fn name(&self) -> &str {
            self.name
        }

        fn origin(&self) -> ModelOrigin {
            self.origin
        }

        fn load(&self, _key: &str) -> Result<Option<Arc<dyn EmbeddingModel>>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(self.model.clone())
        }
    }

    #[tokio::test]
    async fn test_local_model_used_first() {
        let remote = CountingRepository::new("hub", ModelOrigin::Remote, Some(8));
        let remote_loads = remote.loads.clone();
        let provider = EmbeddingProvider::new(8)
            .with_local(CountingRepository::new("disk", ModelOrigin::Local, Some(8)))
            .with_remote(remote)
            .with_policy(RemotePolicy::allow());

        provider.embed("hello").await.unwrap();
        let source = provider.source("default");
        assert_eq!(source.status, ModelStatus::Available);
        assert_eq!(source.origin, Some(ModelOrigin::Local));
        assert_eq!(source.repository.as_deref(), Some("disk"));
        assert_eq!(remote_loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_denied_then_reconfigured() {
        let provider = EmbeddingProvider::new(8)
            .with_local(CountingRepository::new("disk", ModelOrigin::Local, None))
            .with_remote(CountingRepository::new("hub", ModelOrigin::Remote, Some(8)));

        let err = provider.embed("hello").await.unwrap_err();
        match &err {
            Error::ModelUnavailable { model, reason } => {
                assert_eq!(model, "default");
                assert!(reason.contains("disk"));
                assert!(reason.contains("TRIDENT_ALLOW_REMOTE_MODELS"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        // The failure is cached.
        assert!(provider.embed("again").await.is_err());
        assert_eq!(provider.fetch_count(), 1);
        let source = provider.source("default");
        assert_eq!(source.status, ModelStatus::Failed);
        assert_eq!(source.attempts.len(), 2);
        assert_eq!(source.attempts[1].outcome, AttemptOutcome::Skipped);

        provider.reconfigure(RemotePolicy::allow());
        assert_eq!(provider.source("default").status, ModelStatus::Unresolved);
        assert_eq!(provider.embed("hello").await.unwrap().len(), 8);
        assert_eq!(provider.fetch_count(), 2);
        assert_eq!(provider.source("default").origin, Some(ModelOrigin::Remote));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_resolution() {
        let repo = CountingRepository::new("disk", ModelOrigin::Local, Some(16))
            .slow(Duration::from_millis(100));
        let loads = repo.loads.clone();
        let provider = Arc::new(EmbeddingProvider::new(16).with_local(repo));

        let mut handles = Vec::new();
        for i in 0..16 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                provider.embed(&format!("content {}", i)).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 16);
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(provider.fetch_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_is_shared_by_all_waiters() {
        let repo = CountingRepository::new("disk", ModelOrigin::Local, None)
            .slow(Duration::from_millis(50));
        let loads = repo.loads.clone();
        let provider = Arc::new(EmbeddingProvider::new(4).with_local(repo));

        let (a, b) = tokio::join!(provider.embed("a"), provider.embed("b"));
        assert!(matches!(a, Err(Error::ModelUnavailable { .. })));
        assert!(matches!(b, Err(Error::ModelUnavailable { .. })));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_caller_does_not_cancel_resolution() {
        let repo = CountingRepository::new("disk", ModelOrigin::Local, Some(4))
            .slow(Duration::from_millis(100));
        let loads = repo.loads.clone();
        let provider = Arc::new(EmbeddingProvider::new(4).with_local(repo));

        let first = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.embed("abandoned").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();

        assert!(provider.embed("kept").await.is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_resolution_is_retried() {
        let repo = CountingRepository::new("disk", ModelOrigin::Local, Some(4));
        let loads = repo.loads.clone();
        let provider = EmbeddingProvider::new(4).with_local(repo);

        // A flight whose sender died before publishing anything.
        {
            let (tx, rx) = watch::channel(None);
            drop(tx);
            let mut slots = provider.slots.lock();
            slots.next_flight += 1;
            let flight = slots.next_flight;
            slots
                .entries
                .insert("default".to_string(), Slot::Resolving(flight, rx));
        }
        assert_eq!(provider.source("default").status, ModelStatus::Resolving);

        assert!(provider.embed("hello").await.is_ok());
        assert_eq!(provider.source("default").status, ModelStatus::Available);
        assert_eq!(provider.fetch_count(), 1);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_config_error() {
        let provider = EmbeddingProvider::new(8)
            .with_local(CountingRepository::new("disk", ModelOrigin::Local, Some(4)));
        assert!(matches!(
            provider.initialize().await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_mode_never_touches_remote() {
        let remote = CountingRepository::new("hub", ModelOrigin::Remote, Some(4));
        let remote_loads = remote.loads.clone();
        let provider = EmbeddingProvider::new(4)
            .with_remote(remote)
            .with_policy(RemotePolicy::offline());

        let err = provider.embed("x").await.unwrap_err();
        assert!(err.to_string().contains("offline_mode"));
        assert_eq!(remote_loads.load(Ordering::SeqCst), 0);
    }
}

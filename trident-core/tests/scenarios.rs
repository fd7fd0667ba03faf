//! End-to-end scenarios across the index, embedding provider and cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trident_core::cache::{
    BudgetDetector, BudgetSource, RegionKind, StaticMemoryProbe, CONSERVATIVE_FREE_BYTES,
};
use trident_core::embedding::{
    EmbeddingModel, EmbeddingProvider, HashingModel, ModelOrigin, ModelRepository, ModelStatus,
    RemotePolicy, StaticRepository,
};
use trident_core::{DistanceMetric, Error, HnswConfig, HnswIndex, Result};

#[test]
fn scenario_a_exact_order_on_small_index() {
    let index = HnswIndex::new(DistanceMetric::Euclidean, 2, HnswConfig::default());
    index.insert(1, vec![1.0, 0.0]).unwrap(); // a
    index.insert(2, vec![0.0, 1.0]).unwrap(); // b
    index.insert(3, vec![0.9, 0.1]).unwrap(); // c

    let hits = index.search(&[1.0, 0.0], 2, None).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, 1);
    assert_eq!(hits[0].distance, 0.0);
    assert_eq!(hits[1].id, 3);
    assert!((hits[1].distance - 0.1414).abs() < 1e-3);
}

#[tokio::test]
async fn scenario_b_remote_only_after_policy_change() {
    let provider = EmbeddingProvider::new(24)
        .with_policy(RemotePolicy::deny())
        .with_local(StaticRepository::local("bundled"))
        .with_remote(
            StaticRepository::remote("hub").with_model("default", Arc::new(HashingModel::new(24))),
        );

    let err = provider.embed("hello").await.unwrap_err();
    match err {
        Error::ModelUnavailable { model, reason } => {
            assert_eq!(model, "default");
            assert!(reason.contains("allow_remote_models"), "{}", reason);
        }
        other => panic!("expected ModelUnavailable, got {:?}", other),
    }

    provider.reconfigure(RemotePolicy::allow());
    let vector = provider.embed("hello").await.unwrap();
    assert_eq!(vector.len(), 24);

    let source = provider.source("default");
    assert_eq!(source.status, ModelStatus::Available);
    assert_eq!(source.origin, Some(ModelOrigin::Remote));
}

#[test]
fn scenario_c_conservative_budget_without_introspection() {
    let detector = BudgetDetector::new(0.25)
        .unwrap()
        .with_probe(StaticMemoryProbe::unavailable("sandbox"));
    let budget = detector.detect(None).unwrap();

    assert_eq!(budget.total_bytes(), CONSERVATIVE_FREE_BYTES / 4);
    match budget.source() {
        BudgetSource::ConservativeDefault { failed_probes } => {
            assert_eq!(failed_probes, &vec!["sandbox".to_string()]);
        }
        other => panic!("expected conservative default, got {:?}", other),
    }

    let sum: u64 = budget.partitions().iter().map(|p| p.bytes).sum();
    assert_eq!(sum, budget.total_bytes());
    for kind in [RegionKind::IndexLayer, RegionKind::Metadata, RegionKind::QueryResult] {
        assert!(budget.partition_bytes(kind) > 0);
    }
    assert!(budget.partition_bytes(RegionKind::IndexLayer) > budget.partition_bytes(RegionKind::Metadata));
    assert!(budget.partition_bytes(RegionKind::Metadata) > budget.partition_bytes(RegionKind::QueryResult));
}

/// Repository that takes a while to load and counts how often it does.
struct SlowRepository {
    loads: Arc<AtomicUsize>,
}

impl ModelRepository for SlowRepository {
    fn name(&self) -> &str {
        "slow-disk"
    }

    fn origin(&self) -> ModelOrigin {
        ModelOrigin::Local
    }

    fn load(&self, _key: &str) -> Result<Option<Arc<dyn EmbeddingModel>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        Ok(Some(Arc::new(HashingModel::new(16))))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_concurrent_embeds_fetch_once() {
    let loads = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(EmbeddingProvider::new(16).with_local(SlowRepository {
        loads: Arc::clone(&loads),
    }));

    let mut tasks = Vec::new();
    for i in 0..32 {
        let provider = Arc::clone(&provider);
        tasks.push(tokio::spawn(async move {
            provider.embed(&format!("document {}", i)).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().len(), 16);
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(provider.fetch_count(), 1);
}

#[test]
fn delete_is_idempotent() {
    let index = HnswIndex::new(DistanceMetric::Euclidean, 2, HnswConfig::default());
    index.insert(1, vec![0.0, 0.0]).unwrap();
    index.insert(2, vec![1.0, 0.0]).unwrap();

    index.delete(1).unwrap();
    assert!(matches!(index.delete(1), Err(Error::NotFound(1))));
    assert!(matches!(index.delete(7), Err(Error::NotFound(7))));
    assert_eq!(index.len(), 1);
    assert_eq!(index.tombstones(), 1);

    let hits = index.search(&[0.0, 0.0], 5, None).unwrap();
    assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![2]);
}

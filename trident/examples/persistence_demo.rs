//! Persistence demonstration for Trident.
//!
//! This example shows how to:
//! 1. Open a store on a file-backed key-value store
//! 2. Insert records and save a snapshot
//! 3. Reopen (simulating a restart)
//! 4. Verify records, facets and search results survived

use std::fs;
use std::sync::Arc;

use trident::prelude::*;
use trident::FileKvStore;

const STORE_PATH: &str = "./demo_store";

fn open_store(config: &EngineConfig) -> Result<UnifiedStore> {
    let ctx = EngineContext::builder()
        .cache_budget_override(Some(8 << 20))
        .kv_store(Arc::new(FileKvStore::open(STORE_PATH)?))
        .build()?;
    UnifiedStore::open(&ctx, config.clone())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Clean up any previous run
    let _ = fs::remove_dir_all(STORE_PATH);

    println!("🌟 Trident Persistence Demo\n");
    let config = EngineConfig::new(4).with_metric(DistanceMetric::Euclidean);
    let query = [0.9, 0.1, 0.0, 0.0];

    println!("📥 Phase 1: Creating store and inserting records...");
    let before = {
        let store = open_store(&config)?;
        let docs = [
            (1, "Rust programming basics", "rust", [1.0, 0.0, 0.0, 0.0]),
            (2, "Advanced Rust patterns", "rust", [0.8, 0.2, 0.0, 0.0]),
            (3, "Python data science", "python", [0.0, 0.0, 1.0, 0.0]),
            (4, "Async Rust in practice", "rust", [0.7, 0.0, 0.3, 0.0]),
        ];
        for (id, title, lang, vector) in docs {
            store.insert(
                VectorRecord::new(id, vector.to_vec())
                    .with_metadata("title", title)
                    .with_facet("lang", lang),
            )?;
        }
        store.save()?;
        println!("   Saved {} records\n", store.len());
        store.query_vector(&query, 3, &QueryFilter::new())?
    };

    println!("🔄 Phase 2: Reopening store...");
    let store = open_store(&config)?;
    println!("   Store contains {} records", store.len());

    let after = store.query_vector(&query, 3, &QueryFilter::new())?;
    let same = before.iter().map(|h| h.id).eq(after.iter().map(|h| h.id));
    println!("   Results identical after restart: {}\n", same);

    let rust = QueryFilter::new().facet_eq("lang", "rust");
    println!("🔍 Rust records after reload:");
    for hit in store.query_vector(&query, 10, &rust)? {
        println!("   [ID: {}] {} (distance: {:.4})", hit.id, hit.metadata["title"], hit.distance);
    }

    let _ = fs::remove_dir_all(STORE_PATH);
    println!("\n✨ Done!");
    Ok(())
}

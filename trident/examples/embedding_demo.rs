//! Embedding provider demonstration.
//!
//! Shows local-first model resolution, the remote policy gate and querying
//! a store by content. The bundled `HashingModel` stands in for a real
//! embedding model.

use std::sync::Arc;

use trident::embedding::{HashingModel, ModelStatus, RemotePolicy, StaticRepository};
use trident::prelude::*;

const DIM: usize = 128;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("🌟 Trident Embedding Demo\n");

    // The default model only exists on the (simulated) remote hub.
    let provider = Arc::new(
        EmbeddingProvider::new(DIM)
            .with_policy(RemotePolicy::deny())
            .with_local(StaticRepository::local("bundled"))
            .with_remote(
                StaticRepository::remote("model-hub")
                    .with_model("default", Arc::new(HashingModel::new(DIM))),
            ),
    );

    println!("🔒 Remote models denied:");
    match provider.initialize().await {
        Ok(()) => println!("   unexpectedly resolved"),
        Err(e) => println!("   {}\n", e),
    }

    println!("🔓 Allowing remote models and retrying...");
    provider.reconfigure(RemotePolicy::allow());
    provider.initialize().await?;
    let source = provider.source(provider.default_model());
    assert_eq!(source.status, ModelStatus::Available);
    println!(
        "   resolved `{}` from {} ({:?})\n",
        source.key,
        source.repository.as_deref().unwrap_or("?"),
        source.origin
    );

    let config = EngineConfig::new(DIM).with_cache_budget_bytes(8 << 20);
    let ctx = EngineContext::builder()
        .cache_budget_override(config.cache_budget_bytes)
        .embedder(Arc::clone(&provider))
        .build()?;
    let store = UnifiedStore::open(&ctx, config)?;

    let docs = [
        (1, "rust ownership and borrowing explained"),
        (2, "baking sourdough bread at home"),
        (3, "async rust with tokio runtimes"),
        (4, "a beginner guide to sourdough starters"),
    ];
    println!("📥 Embedding {} documents...", docs.len());
    for (id, text) in docs {
        store
            .insert_content(id, text, RecordAttributes::new().with_metadata("text", text))
            .await?;
    }

    for question in ["tokio async rust", "sourdough bread"] {
        println!("\n🔍 {}", question);
        let hits = store.query(question.into(), 2, &QueryFilter::new()).await?;
        for hit in hits {
            println!("   [ID: {}] {} (distance: {:.4})", hit.id, hit.metadata["text"], hit.distance);
        }
    }

    println!("\n✨ Done!");
    Ok(())
}

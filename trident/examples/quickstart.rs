//! Quick start example for Trident.
//!
//! Inserts a handful of documents with facets and edges, then runs a plain,
//! a facet-filtered and a graph-filtered search.

use trident::prelude::*;
use trident::store::Direction;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("🌟 Trident Quick Start Example\n");

    // Small dimension for demonstration; real embeddings are 384-1536 dim
    let config = EngineConfig::new(8).with_cache_budget_bytes(4 << 20);
    let ctx = EngineContext::from_config(&config)?;
    let store = UnifiedStore::open(&ctx, config)?;

    // (id, title, language, cites, embedding)
    let documents: Vec<(u64, &str, &str, Vec<u64>, [f32; 8])> = vec![
        (1, "Introduction to Rust programming", "rust", vec![], [0.9, 0.8, 0.1, 0.0, 0.1, 0.0, 0.2, 0.1]),
        (2, "Advanced Rust patterns and idioms", "rust", vec![1], [0.85, 0.9, 0.15, 0.05, 0.1, 0.0, 0.25, 0.15]),
        (3, "Python for data science", "python", vec![], [0.1, 0.2, 0.9, 0.85, 0.0, 0.1, 0.0, 0.2]),
        (4, "Machine learning fundamentals", "python", vec![3], [0.2, 0.1, 0.7, 0.8, 0.6, 0.7, 0.1, 0.3]),
        (5, "Systems programming with Rust", "rust", vec![2, 4], [0.8, 0.7, 0.2, 0.1, 0.15, 0.05, 0.3, 0.2]),
    ];

    println!("📥 Inserting {} documents...", documents.len());
    for (id, title, lang, cites, embedding) in &documents {
        let mut record = VectorRecord::new(*id, embedding.to_vec())
            .with_metadata("title", *title)
            .with_facet("lang", *lang);
        for cited in cites {
            record = record.with_edge(*cited);
        }
        store.insert(record)?;
    }
    println!("✅ Store contains {} records\n", store.len());

    let query = [0.88, 0.85, 0.12, 0.03, 0.12, 0.02, 0.22, 0.12];

    println!("🔍 Top 3 documents similar to 'Rust programming':");
    print_hits(&store.query_vector(&query, 3, &QueryFilter::new())?);

    println!("🔍 Only Python documents:");
    let python = QueryFilter::new().facet_eq("lang", "python");
    print_hits(&store.query_vector(&query, 3, &python)?);

    println!("🔍 Documents within two citations of #5:");
    let cited = QueryFilter::new()
        .within_hops(5, 2)
        .with_direction(Direction::Outgoing);
    print_hits(&store.query_vector(&query, 10, &cited)?);

    println!("✨ Done! Trident is working correctly.");
    Ok(())
}

fn print_hits(hits: &[QueryHit]) {
    println!("{:-<60}", "");
    for (rank, hit) in hits.iter().enumerate() {
        let title = hit
            .metadata
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown");
        println!(
            "  {}. [ID: {}] {} (distance: {:.4})",
            rank + 1,
            hit.id,
            title,
            hit.distance
        );
    }
    println!("{:-<60}\n", "");
}

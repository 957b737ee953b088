//! Engram Pipeline Benchmarks
//!
//! Benchmarks for the hot retrieval-path operations using Criterion.
//! Run with: cargo bench -p engram-core

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use engram_core::encoding::{cosine_similarity, to_unit_vector};
use engram_core::{
    DeterministicEmbeddingProvider, EmbeddingProvider, MemoryRecord, RetrievalRanker, StorageTier,
    VectorStore,
};

fn record(id: usize, embedding: Vec<f32>) -> MemoryRecord {
    let now = Utc::now();
    let embedding = to_unit_vector(embedding);
    MemoryRecord {
        memory_id: format!("mem-{id}"),
        account_key: "bench".to_string(),
        event_id: format!("event-{id}"),
        content: "benchmark memory content with a few words in it".to_string(),
        summary: "benchmark memory".to_string(),
        intent: "user_question".to_string(),
        entities: vec!["bench-entity".to_string()],
        relationships: vec![],
        raw_embedding: embedding.clone(),
        semantic_embedding: embedding,
        semantic_key: format!("key-{}", id % 16),
        created_at: now,
        updated_at: now,
        retrieval_count: (id % 7) as i64,
        avg_outcome_signal: 0.0,
        outcome_count: 0,
        storage_tier: StorageTier::Persistent,
        latest_importance: 0.5,
        is_compressed: false,
        original_count: 1,
        decay_half_life_days: None,
    }
}

fn embedding(seed: usize, dim: usize) -> Vec<f32> {
    (0..dim).map(|i| ((seed * dim + i) as f32).sin()).collect()
}

fn bench_deterministic_embed(c: &mut Criterion) {
    let provider = DeterministicEmbeddingProvider::new(384);
    c.bench_function("deterministic_embed_384d", |b| {
        b.iter(|| {
            black_box(provider.embed("How do Python for-loops work?").unwrap());
        })
    });
}

fn bench_cosine_similarity(c: &mut Criterion) {
    let a: Vec<f32> = embedding(1, 384);
    let b_vec: Vec<f32> = embedding(2, 384);
    c.bench_function("cosine_similarity_384d", |bench| {
        bench.iter(|| {
            black_box(cosine_similarity(&a, &b_vec));
        })
    });
}

fn bench_vector_store_search(c: &mut Criterion) {
    let store = VectorStore::new(256, "bench_unused.idx");
    for i in 0..1000 {
        store.add(&format!("mem-{i}"), &embedding(i, 256));
    }
    let query = to_unit_vector(embedding(7, 256));
    c.bench_function("vector_preselect_1k_top80", |b| {
        b.iter(|| {
            black_box(store.search(&query, 80));
        })
    });
}

fn bench_ranker(c: &mut Criterion) {
    let ranker = RetrievalRanker::new(1e-3, 100, 64);
    let candidates: Vec<MemoryRecord> = (0..80).map(|i| record(i, embedding(i, 256))).collect();
    let query = to_unit_vector(embedding(3, 256));
    c.bench_function("rank_80_candidates", |b| {
        b.iter(|| {
            black_box(ranker.rank(&query, &candidates, Utc::now()));
        })
    });
}

criterion_group!(
    benches,
    bench_deterministic_embed,
    bench_cosine_similarity,
    bench_vector_store_search,
    bench_ranker,
);
criterion_main!(benches);

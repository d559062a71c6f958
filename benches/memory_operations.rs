//! Benchmarks for memory operations (episodic remember, semantic recall, consolidation).

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memtiers::{Concept, FakeEmbeddingClient, FakeLlmClient, MemoryConfig, MemoryInterface, Store};
use tokio::runtime::Runtime;
use tracing::info;

fn facade() -> MemoryInterface {
    let store = Store::open_in_memory();
    let llm = Arc::new(FakeLlmClient::with_response("{}"));
    let embedder = Arc::new(FakeEmbeddingClient::new(64));
    MemoryInterface::from_parts(store, llm, embedder, MemoryConfig::for_testing())
}

fn remember_benchmark(c: &mut Criterion) {
    info!("Starting remember benchmark");

    let mut group = c.benchmark_group("remember");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_episode", |b| {
        let memory = facade();
        b.iter(|| {
            memory
                .remember(
                    black_box("Test message for benchmarking".to_string()),
                    std::collections::HashMap::new(),
                    None,
                    None,
                    1.0,
                )
                .unwrap();
        });
    });

    group.finish();
}

fn recall_benchmark(c: &mut Criterion) {
    info!("Starting recall benchmark");

    let rt = Runtime::new().unwrap();
    let memory = facade();
    for i in 0..1000 {
        let mut concept = Concept::new(format!("Concept {i} about Rust programming"), 0.8, vec![]);
        let embedding = rt.block_on(async {
            memtiers::EmbeddingClient::embed(
                &FakeEmbeddingClient::new(64),
                &concept.summary,
            )
            .await
            .unwrap()
        });
        concept.embedding = Some(embedding);
        memory.import_memory(&memtiers::ExportedData {
            version: 1,
            concepts: vec![concept],
            episodes: vec![],
            entities: vec![],
            mentions: vec![],
            entity_relations: vec![],
        })
        .unwrap();
    }

    let mut group = c.benchmark_group("recall");
    for limit in &[5, 10, 20, 50] {
        group.bench_with_input(BenchmarkId::from_parameter(limit), limit, |b, &limit| {
            b.to_async(&rt).iter(|| async {
                memory
                    .recall(black_box("Rust ownership"), Some(limit), None, None, true)
                    .await
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn consolidation_benchmark(c: &mut Criterion) {
    info!("Starting consolidation benchmark");

    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("consolidation");
    group.sample_size(10); // Consolidation runs sequential LLM/embedding calls; keep it cheap.
    group.throughput(Throughput::Elements(20));

    group.bench_function("20_episodes", |b| {
        b.iter_with_setup(
            || {
                let store = Store::open_in_memory();
                let memory = MemoryInterface::from_parts(
                    store,
                    Arc::new(FakeLlmClient::with_response(
                        serde_json::json!({
                            "analysis": "benchmark batch",
                            "updates": [],
                            "new_concepts": [],
                            "new_relations": [],
                            "contradictions": []
                        })
                        .to_string(),
                    )),
                    Arc::new(FakeEmbeddingClient::new(64)),
                    MemoryConfig::for_testing(),
                );
                for i in 0..20 {
                    memory
                        .remember(
                            format!("Consolidation benchmark message {i}"),
                            std::collections::HashMap::new(),
                            None,
                            None,
                            1.0,
                        )
                        .unwrap();
                }
                memory
            },
            |memory| {
                rt.block_on(async {
                    memory.consolidate(true).await.unwrap();
                });
            },
        );
    });

    group.finish();
}

fn find_by_embedding_benchmark(c: &mut Criterion) {
    info!("Starting find_by_embedding benchmark");

    let embedder = FakeEmbeddingClient::new(64);
    let rt = Runtime::new().unwrap();
    let store = Store::open_in_memory();
    for i in 0..2000 {
        let mut concept = Concept::new(format!("Stored concept {i}"), 0.7, vec![]);
        concept.embedding = Some(rt.block_on(async {
            memtiers::EmbeddingClient::embed(&embedder, &concept.summary).await.unwrap()
        }));
        store.add_concept(&concept).unwrap();
    }
    let query = rt.block_on(async { memtiers::EmbeddingClient::embed(&embedder, "Stored concept 42").await.unwrap() });

    let mut group = c.benchmark_group("find_by_embedding");
    group.throughput(Throughput::Elements(2000));
    group.bench_function("linear_scan_2000_concepts", |b| {
        b.iter(|| {
            store.find_by_embedding(black_box(&query), black_box(10)).unwrap();
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    remember_benchmark,
    recall_benchmark,
    consolidation_benchmark,
    find_by_embedding_benchmark,
);
criterion_main!(benches);

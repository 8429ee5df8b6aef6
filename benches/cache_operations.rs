//! Benchmarks for cache operations
//!
//! This benchmark suite measures:
//! - Writes routed by strategy (plain, compressed, encrypted)
//! - Memory-tier hits vs relational hits with promotion
//! - Cold misses across all three tiers
//! - Queue enqueue cost

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use offline_cache_sync::cache_coordinator::CacheOptions;
use offline_cache_sync::entry::TierKind;
use offline_cache_sync::{
    ChangeFilter, ChangeStream, CoreConfig, EnqueueOptions, Mutation, QueryError, RemoteLink, SyncCore,
    async_trait,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// Backend that accepts everything
struct NullRemote;

#[async_trait]
impl RemoteLink for NullRemote {
    async fn apply(&self, _mutation: &Mutation) -> Result<Value, QueryError> {
        Ok(Value::Null)
    }

    async fn fetch_record(&self, _table: &str, _id: &str) -> Result<Option<Value>, QueryError> {
        Ok(None)
    }

    async fn ping(&self) -> Result<(), QueryError> {
        Ok(())
    }

    async fn subscribe_changes(&self, _filter: &ChangeFilter) -> Result<ChangeStream, QueryError> {
        Ok(Box::pin(futures_util::stream::pending()))
    }
}

fn setup_core() -> (SyncCore, Runtime) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let mut config = CoreConfig::default();
    config.coordinator.encryption_key = Some(KEY_HEX.to_string());
    config.memory.max_entries = 10_000;
    let core = rt.block_on(async {
        SyncCore::builder(Arc::new(NullRemote))
            .with_config(config)
            .build()
            .unwrap_or_else(|_| panic!("Failed to build core"))
    });
    (core, rt)
}

/// Generate test data of specified size
fn test_data(size_bytes: usize) -> Value {
    json!({
        "body": "x".repeat(size_bytes),
        "size": size_bytes,
        "updated_at": "2025-01-01T00:00:00Z"
    })
}

/// Benchmark writes per strategy and payload size
fn bench_cache_set(c: &mut Criterion) {
    let (core, rt) = setup_core();
    let cache = core.cache().clone();

    let mut group = c.benchmark_group("cache_set");
    group.measurement_time(Duration::from_secs(10));

    for size in &[100, 1024, 10_240, 102_400] {
        let data = test_data(*size);
        for prefix in ["leaderboard", "lesson_content", "student_profile"] {
            group.bench_with_input(BenchmarkId::new(prefix, size), size, |b, _| {
                b.to_async(&rt).iter(|| async {
                    let key = format!("{prefix}:{}", rand::random::<u32>());
                    cache.set(&key, black_box(&data)).await;
                });
            });
        }
    }

    group.finish();
}

/// Benchmark hits served by the memory tier
fn bench_memory_hit(c: &mut Criterion) {
    let (core, rt) = setup_core();
    let cache = core.cache().clone();
    rt.block_on(cache.set("user_preferences:bench", &test_data(256)));

    c.bench_function("memory_hit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(cache.get::<Value>("user_preferences:bench").await);
        });
    });
}

/// Benchmark relational hits, each promoted into the upper tiers
fn bench_relational_hit_with_promotion(c: &mut Criterion) {
    let (core, rt) = setup_core();
    let cache = core.cache().clone();
    let relational_only = CacheOptions::new()
        .skip(TierKind::Memory)
        .skip(TierKind::Persistent);

    c.bench_function("relational_hit_promote", |b| {
        b.to_async(&rt).iter(|| async {
            let key = format!("course:{}", rand::random::<u32>());
            cache.set_with(&key, &test_data(256), &relational_only).await;
            black_box(cache.get::<Value>(&key).await);
        });
    });
}

/// Benchmark misses that walk all three tiers
fn bench_cold_miss(c: &mut Criterion) {
    let (core, rt) = setup_core();
    let cache = core.cache().clone();

    c.bench_function("cold_miss", |b| {
        b.to_async(&rt).iter(|| async {
            let key = format!("missing:{}", rand::random::<u32>());
            black_box(cache.get::<Value>(&key).await);
        });
    });
}

/// Benchmark durable enqueue into the offline queue
fn bench_enqueue(c: &mut Criterion) {
    let (core, rt) = setup_core();
    let queue = core.queue().clone();

    c.bench_function("queue_enqueue", |b| {
        b.to_async(&rt).iter(|| async {
            let mutation = Mutation::insert("progress", json!({"score": rand::random::<u8>()}));
            black_box(queue.enqueue(mutation, EnqueueOptions::new()).await);
        });
    });
}

criterion_group!(
    benches,
    bench_cache_set,
    bench_memory_hit,
    bench_relational_hit_with_promotion,
    bench_cold_miss,
    bench_enqueue
);
criterion_main!(benches);

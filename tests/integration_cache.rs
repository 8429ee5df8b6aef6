//! Integration tests for the cache tiers behind a wired core

mod common;

use common::*;
use offline_cache_sync::cache_coordinator::CacheOptions;
use offline_cache_sync::entry::TierKind;
use offline_cache_sync::{CachePriority, FileKeyValueStore, KeyValueStore};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn upper_tiers_only() -> CacheOptions {
    CacheOptions::new().skip(TierKind::Relational)
}

fn memory_only() -> CacheOptions {
    CacheOptions::new()
        .skip(TierKind::Persistent)
        .skip(TierKind::Relational)
}

/// Test round trip through plain, compressed and encrypted strategies
#[tokio::test]
async fn test_round_trip_across_strategies() {
    let t = build_core(test_config());
    let cache = t.core.cache();

    let plain = json!({"theme": "dark", "font_size": 14});
    let big_lesson = lesson(1, 64 * 1024);
    let profile = profile("s1", "2024-05-01T12:00:00Z");

    cache.set("user_preferences:s1", &plain).await;
    cache.set("lesson_content:1", &big_lesson).await;
    cache.set("student_profile:s1", &profile).await;

    assert_eq!(cache.get::<Value>("user_preferences:s1").await, Some(plain));
    assert_eq!(cache.get::<Value>("lesson_content:1").await, Some(big_lesson));
    assert_eq!(cache.get::<Value>("student_profile:s1").await, Some(profile));
}

/// Test entries expire exactly at their deadline, including zero TTL
#[tokio::test]
async fn test_ttl_boundaries() {
    let t = build_core(test_config());
    let cache = t.core.cache();

    cache
        .set_with("quiz:1", &json!(1), &CacheOptions::new().with_ttl(Duration::from_secs(10)))
        .await;
    cache
        .set_with("quiz:2", &json!(2), &CacheOptions::new().with_ttl(Duration::ZERO))
        .await;
    assert_eq!(cache.get::<Value>("quiz:2").await, None);

    t.clock.advance(Duration::from_millis(9_999));
    assert_eq!(cache.get::<Value>("quiz:1").await, Some(json!(1)));

    t.clock.advance(Duration::from_millis(1));
    assert_eq!(cache.get::<Value>("quiz:1").await, None);
}

/// Test the memory tier evicts the least recently accessed entry
#[tokio::test]
async fn test_memory_tier_lru_eviction() {
    let mut config = test_config();
    config.memory.max_entries = 2;
    let t = build_core(config);
    let cache = t.core.cache();
    let critical = CacheOptions::new().with_priority(CachePriority::Critical);

    cache.set_with("a", &json!("a"), &critical).await;
    cache.set_with("b", &json!("b"), &critical).await;
    // Touch "a" so "b" becomes least recently used
    assert!(cache.get_with::<Value>("a", &memory_only()).await.is_some());
    cache.set_with("c", &json!("c"), &critical).await;

    assert_eq!(cache.get_with::<Value>("a", &memory_only()).await, Some(json!("a")));
    assert_eq!(cache.get_with::<Value>("b", &memory_only()).await, None);
    assert_eq!(cache.get_with::<Value>("c", &memory_only()).await, Some(json!("c")));

    let stats = cache.get_stats().await;
    assert_eq!(stats.tier(TierKind::Memory).unwrap().evictions, 1);

    // Still served by the lower tiers
    assert_eq!(cache.get::<Value>("b").await, Some(json!("b")));
}

/// Test a relational-only hit is promoted into memory and persistent
#[tokio::test]
async fn test_relational_hit_promotes() {
    let t = build_core(test_config());
    let cache = t.core.cache();
    let relational_only = CacheOptions::new()
        .skip(TierKind::Memory)
        .skip(TierKind::Persistent);

    cache.set_with("course:7", &json!({"name": "Algebra"}), &relational_only).await;
    assert_eq!(cache.get_with::<Value>("course:7", &upper_tiers_only()).await, None);

    assert_eq!(cache.get::<Value>("course:7").await, Some(json!({"name": "Algebra"})));

    assert!(cache.get_with::<Value>("course:7", &memory_only()).await.is_some());
    let persistent_only = CacheOptions::new()
        .skip(TierKind::Memory)
        .skip(TierKind::Relational);
    assert!(cache.get_with::<Value>("course:7", &persistent_only).await.is_some());
    assert_eq!(cache.get_stats().await.promotions, 2);
}

/// Test invalidating the same tags twice changes nothing the second time
#[tokio::test]
async fn test_tag_invalidation_is_idempotent() {
    let t = build_core(test_config());
    let cache = t.core.cache();

    cache.set("lesson_content:1", &lesson(1, 32)).await;
    cache.set("curriculum:math", &json!({"units": 4})).await;
    cache.set("leaderboard:weekly", &json!([1, 2, 3])).await;

    let tags = vec!["content".to_string()];
    assert_eq!(cache.invalidate_by_tags(&tags).await, 2);
    let after_first = cache.get_stats().await.total_entries;
    assert_eq!(cache.invalidate_by_tags(&tags).await, 0);
    assert_eq!(cache.get_stats().await.total_entries, after_first);

    assert_eq!(cache.get::<Value>("lesson_content:1").await, None);
    assert!(cache.get::<Value>("leaderboard:weekly").await.is_some());
}

/// Test pattern invalidation across tiers
#[tokio::test]
async fn test_pattern_invalidation() {
    let t = build_core(test_config());
    let cache = t.core.cache();

    cache.set("quiz:1:answers", &json!([1])).await;
    cache.set("quiz:2:answers", &json!([2])).await;
    cache.set("quiz:2:meta", &json!({})).await;

    assert_eq!(cache.invalidate_pattern("quiz:*:answers").await, 2);
    assert!(cache.get::<Value>("quiz:2:meta").await.is_some());
}

/// Test a cold read misses once per tier and reports nothing
#[tokio::test]
async fn test_cold_read_records_one_miss_per_tier() {
    let t = build_core(test_config());
    let cache = t.core.cache();

    assert_eq!(cache.get::<Value>("k1").await, None);

    let stats = cache.get_stats().await;
    for kind in [TierKind::Memory, TierKind::Persistent, TierKind::Relational] {
        let tier = stats.tier(kind).unwrap();
        assert_eq!(tier.misses, 1, "tier {kind:?}");
        assert_eq!(tier.hits, 0);
    }
    assert_eq!(stats.misses, 1);
}

/// Test persistent entries and queued writes survive a restart
#[tokio::test]
async fn test_restart_restores_cache_and_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::open(dir.path()).await.unwrap());

    let remote = MockRemote::new();
    remote.set_reachable(false);
    let first = build_core_with(test_config(), remote.clone(), Some(store.clone()));
    let report = first.core.init().await.unwrap();
    assert!(!report.connected);

    first.core.cache().set("lesson_content:9", &lesson(9, 16)).await;
    first
        .core
        .queue()
        .enqueue(
            offline_cache_sync::Mutation::insert("progress", json!({"id": "p9", "score": 80})),
            offline_cache_sync::EnqueueOptions::new(),
        )
        .await;
    first.core.shutdown();
    drop(first);

    remote.set_reachable(true);
    let store: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::open(dir.path()).await.unwrap());
    let second = build_core_with(test_config(), remote.clone(), Some(store));
    let report = second.core.init().await.unwrap();

    assert!(report.connected);
    assert!(report.restored_entries >= 1);
    assert_eq!(report.pending_operations, 1);
    // Connecting replays the restored operation
    assert!(second.core.queue().is_empty());
    assert_eq!(remote.record("progress", "p9").unwrap()["score"], 80);
    assert_eq!(
        second.core.cache().get::<Value>("lesson_content:9").await,
        Some(lesson(9, 16))
    );
    second.core.shutdown();
}

/// Test the tier health probe through the container
#[tokio::test]
async fn test_health_check() {
    let t = build_core(test_config());
    assert!(t.core.health_check().await);
}

//! Memory Tier - Bounded In-Process LRU
//!
//! The fastest tier. Bounded by entry count and by bytes; when a `set`
//! breaks either bound the least-recently-accessed entries are evicted until
//! both hold again.

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use super::lru::LruIndex;
use crate::clock::Clock;
use crate::config::MemoryTierConfig;
use crate::entry::{CacheEntry, TierKind};
use crate::pattern::KeyFilter;
use crate::traits::TierStore;

/// Strict-LRU in-memory tier
///
/// **Features**:
/// - O(log n) recency updates through a tick-ordered index
/// - Entry-count and byte bounds, enforced on every `set`
/// - Lazy removal of expired entries on `get`, plus an explicit sweep
///
/// **Example**:
/// ```rust
/// use offline_cache_sync::backends::MemoryTier;
/// use offline_cache_sync::config::MemoryTierConfig;
/// use offline_cache_sync::clock::SystemClock;
/// use std::sync::Arc;
///
/// let tier = MemoryTier::new(MemoryTierConfig::default(), Arc::new(SystemClock));
/// assert_eq!(tier.len(), 0);
/// ```
pub struct MemoryTier {
    index: Mutex<LruIndex<CacheEntry>>,
    config: MemoryTierConfig,
    clock: Arc<dyn Clock>,
    /// Hit counter
    hits: AtomicU64,
    /// Miss counter
    misses: AtomicU64,
    /// Set counter
    sets: AtomicU64,
    /// Entries dropped to satisfy the bounds
    evictions: AtomicU64,
}

impl MemoryTier {
    #[must_use]
    pub fn new(config: MemoryTierConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            max_entries = config.max_entries,
            max_bytes = config.max_bytes,
            "Initializing memory tier"
        );

        Self {
            index: Mutex::new(LruIndex::default()),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MemoryTierConfig {
        &self.config
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is stored, without touching its recency
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.index.lock().contains(key)
    }

    /// Keys from least to most recently accessed
    #[must_use]
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.index.lock().keys_by_recency().cloned().collect()
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn record_evictions(&self, evicted: &[(String, CacheEntry)]) {
        if evicted.is_empty() {
            return;
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for (key, _) in evicted {
            debug!(key = %key, "[Memory] Evicted least-recently-used entry");
        }
    }
}

#[async_trait]
impl TierStore for MemoryTier {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = self.clock.now_millis();
        let mut index = self.index.lock();

        let expired = match index.peek(key) {
            Some(entry) => entry.is_expired_at(now),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if expired {
            index.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "[Memory] Dropped expired entry on read");
            return Ok(None);
        }

        let entry = index.touch(key).map(|entry| {
            entry.record_access(now);
            entry.clone()
        });
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        if entry.size_bytes > self.config.max_bytes {
            bail!(
                "entry '{}' ({} bytes) exceeds memory tier capacity of {} bytes",
                entry.key,
                entry.size_bytes,
                self.config.max_bytes
            );
        }

        let key = entry.key.clone();
        let size = entry.size_bytes;
        let evicted = {
            let mut index = self.index.lock();
            index.insert(key.clone(), entry, size);
            index.evict_over(self.config.max_entries, self.config.max_bytes)
        };
        self.record_evictions(&evicted);
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, size_bytes = size, "[Memory] Stored entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.index.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.index.lock().clear();
        Ok(())
    }

    async fn current_size(&self) -> Result<u64> {
        Ok(self.index.lock().total_bytes())
    }

    async fn entry_count(&self) -> Result<usize> {
        Ok(self.len())
    }

    async fn find_by_tag_or_pattern(&self, filter: &KeyFilter) -> Result<Vec<String>> {
        let index = self.index.lock();
        Ok(index
            .iter()
            .filter(|(key, entry)| filter.matches(key, &entry.tags))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let removed = self
            .index
            .lock()
            .drain_where(|_, entry| entry.is_expired_at(now))
            .len();
        if removed > 0 {
            debug!(count = removed, "[Memory] Swept expired entries");
        }
        Ok(removed)
    }

    async fn evict_to(&self, target_bytes: u64) -> Result<usize> {
        let evicted = self
            .index
            .lock()
            .evict_over(usize::MAX, target_bytes);
        self.record_evictions(&evicted);
        Ok(evicted.len())
    }

    fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    async fn health_check(&self) -> bool {
        // Nothing external can fail; a poisoned state is impossible with parking_lot
        true
    }

    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entry::Envelope;
    use serde_json::json;
    use std::time::Duration;

    fn tier(max_entries: usize, clock: Arc<ManualClock>) -> MemoryTier {
        MemoryTier::new(
            MemoryTierConfig {
                max_entries,
                max_bytes: 1024 * 1024,
            },
            clock,
        )
    }

    fn entry(key: &str, now: u64) -> CacheEntry {
        CacheEntry::new(key, Envelope::plain(json!({"k": key})), now, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_capacity_plus_one_evicts_least_recent() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = tier(3, Arc::clone(&clock));
        for key in ["a", "b", "c"] {
            tier.set(entry(key, 0)).await.unwrap_or_default();
        }
        tier.set(entry("d", 0)).await.unwrap_or_default();

        assert!(!tier.contains("a"));
        assert_eq!(tier.keys_by_recency(), vec!["b", "c", "d"]);
        assert_eq!(tier.eviction_count(), 1);
    }

    #[tokio::test]
    async fn test_access_resets_recency() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = tier(3, Arc::clone(&clock));
        for key in ["a", "b", "c"] {
            tier.set(entry(key, 0)).await.unwrap_or_default();
        }
        let hit = tier.get("a").await.ok().flatten();
        assert_eq!(hit.map(|e| e.access_count), Some(1));

        tier.set(entry("d", 0)).await.unwrap_or_default();
        assert!(tier.contains("a"));
        assert!(!tier.contains("b"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss_and_removed() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = tier(10, Arc::clone(&clock));
        tier.set(entry("a", 0)).await.unwrap_or_default();

        clock.advance(Duration::from_secs(60));
        assert!(tier.get("a").await.ok().flatten().is_none());
        assert!(!tier.contains("a"));
        assert_eq!(tier.misses(), 1);
    }

    #[tokio::test]
    async fn test_byte_bound_evicts() {
        let clock = Arc::new(ManualClock::new(0));
        let first = entry("a", 0);
        let budget = first.size_bytes * 2;
        let tier = MemoryTier::new(
            MemoryTierConfig {
                max_entries: 100,
                max_bytes: budget,
            },
            clock,
        );
        tier.set(first).await.unwrap_or_default();
        tier.set(entry("b", 0)).await.unwrap_or_default();
        tier.set(entry("c", 0)).await.unwrap_or_default();

        assert!(tier.current_size().await.unwrap_or(u64::MAX) <= budget);
        assert!(!tier.contains("a"));
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = MemoryTier::new(
            MemoryTierConfig {
                max_entries: 10,
                max_bytes: 4,
            },
            clock,
        );
        assert!(tier.set(entry("a", 0)).await.is_err());
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_evict_to_target() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = tier(10, Arc::clone(&clock));
        for key in ["a", "b", "c", "d"] {
            tier.set(entry(key, 0)).await.unwrap_or_default();
        }
        let one = entry("x", 0).size_bytes;
        let evicted = tier.evict_to(one * 2).await.unwrap_or_default();
        assert_eq!(evicted, 2);
        assert_eq!(tier.keys_by_recency(), vec!["c", "d"]);
    }
}

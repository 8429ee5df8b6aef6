//! Persistent Tier - Durable Key-Value Cache
//!
//! Stores each entry as a JSON record in a [`KeyValueStore`] under a
//! namespaced key, with an in-memory recency index for bound enforcement.
//! The index is rebuilt by [`PersistentTier::load`] at start, which drops
//! every record that has already expired or cannot be decoded.

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::lru::LruIndex;
use crate::clock::Clock;
use crate::codecs::JsonCodec;
use crate::config::PersistentTierConfig;
use crate::entry::{CacheEntry, TierKind};
use crate::pattern::KeyFilter;
use crate::traits::{CacheCodec, KeyValueStore, TierStore};

#[derive(Debug, Clone)]
struct EntryMeta {
    expires_at: u64,
    tags: BTreeSet<String>,
}

impl From<&CacheEntry> for EntryMeta {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            expires_at: entry.expires_at,
            tags: entry.tags.clone(),
        }
    }
}

/// Outcome of rebuilding the index from durable storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub dropped_expired: usize,
    pub dropped_corrupt: usize,
    pub evicted: usize,
}

/// Durable tier over the platform key-value store
///
/// This is the warm tier, providing:
/// - Survival across process restarts
/// - Entry-count and byte bounds with LRU eviction
/// - Tag and glob scans served from the in-memory index
pub struct PersistentTier {
    store: Arc<dyn KeyValueStore>,
    codec: JsonCodec,
    index: Mutex<LruIndex<EntryMeta>>,
    config: PersistentTierConfig,
    clock: Arc<dyn Clock>,
    /// Hit counter
    hits: AtomicU64,
    /// Miss counter
    misses: AtomicU64,
    /// Set counter
    sets: AtomicU64,
    evictions: AtomicU64,
}

impl PersistentTier {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: PersistentTierConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            store = store.name(),
            namespace = %config.namespace,
            max_entries = config.max_entries,
            "Initializing persistent tier"
        );

        Self {
            store,
            codec: JsonCodec,
            index: Mutex::new(LruIndex::default()),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.namespace, key)
    }

    /// Rebuild the index from durable storage.
    ///
    /// Expired and undecodable records are removed from the store. Survivors
    /// are indexed in `last_accessed_at` order, then the bounds are applied.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store cannot list its keys.
    pub async fn load(&self) -> Result<LoadReport> {
        let now = self.clock.now_millis();
        let mut report = LoadReport::default();
        let mut survivors = Vec::new();

        for storage_key in self.store.get_all_keys().await? {
            let Some(key) = storage_key.strip_prefix(&self.config.namespace) else {
                continue;
            };

            let raw = match self.store.get_item(&storage_key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "[Persistent] Failed to read record during load");
                    continue;
                }
            };

            match self.codec.decode::<CacheEntry>(&raw) {
                Ok(entry) if entry.is_expired_at(now) => {
                    report.dropped_expired += 1;
                    self.remove_quietly(&storage_key).await;
                }
                Ok(entry) => survivors.push(entry),
                Err(e) => {
                    debug!(key = %key, error = %e, "[Persistent] Dropping undecodable record");
                    report.dropped_corrupt += 1;
                    self.remove_quietly(&storage_key).await;
                }
            }
        }

        survivors.sort_by_key(|entry| entry.last_accessed_at);
        let evicted = {
            let mut index = self.index.lock();
            index.clear();
            for entry in &survivors {
                index.insert(entry.key.clone(), EntryMeta::from(entry), entry.size_bytes);
            }
            index.evict_over(self.config.max_entries, self.config.max_bytes)
        };
        report.loaded = survivors.len() - evicted.len();
        report.evicted = evicted.len();
        self.drop_evicted(evicted).await;

        info!(
            loaded = report.loaded,
            dropped_expired = report.dropped_expired,
            dropped_corrupt = report.dropped_corrupt,
            "[Persistent] Index rebuilt from storage"
        );
        Ok(report)
    }

    async fn remove_quietly(&self, storage_key: &str) {
        if let Err(e) = self.store.remove_item(storage_key).await {
            warn!(key = %storage_key, error = %e, "[Persistent] Failed to remove record");
        }
    }

    async fn drop_evicted(&self, evicted: Vec<(String, EntryMeta)>) {
        if evicted.is_empty() {
            return;
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for (key, _) in evicted {
            debug!(key = %key, "[Persistent] Evicted least-recently-used entry");
            self.remove_quietly(&self.storage_key(&key)).await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.index.lock().contains(key)
    }
}

#[async_trait]
impl TierStore for PersistentTier {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        if !self.contains(key) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let storage_key = self.storage_key(key);
        let Some(raw) = self.store.get_item(&storage_key).await? else {
            self.index.lock().remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let mut entry: CacheEntry = self.codec.decode(&raw)?;
        let now = self.clock.now_millis();
        if entry.is_expired_at(now) {
            self.index.lock().remove(key);
            self.remove_quietly(&storage_key).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "[Persistent] Dropped expired entry on read");
            return Ok(None);
        }

        self.index.lock().touch(key);
        entry.record_access(now);
        // load() orders the index by the stored recency
        match self.codec.encode(&entry) {
            Ok(raw) => {
                if let Err(e) = self.store.set_item(&storage_key, &raw).await {
                    warn!(key = %key, error = %e, "[Persistent] Failed to store access time");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "[Persistent] Failed to encode access time"),
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry))
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        if entry.size_bytes > self.config.max_bytes {
            bail!(
                "entry '{}' ({} bytes) exceeds persistent tier capacity of {} bytes",
                entry.key,
                entry.size_bytes,
                self.config.max_bytes
            );
        }

        let raw = self.codec.encode(&entry)?;
        self.store.set_item(&self.storage_key(&entry.key), &raw).await?;

        let evicted = {
            let mut index = self.index.lock();
            index.insert(entry.key.clone(), EntryMeta::from(&entry), entry.size_bytes);
            index.evict_over(self.config.max_entries, self.config.max_bytes)
        };
        self.drop_evicted(evicted).await;
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %entry.key, size_bytes = entry.size_bytes, "[Persistent] Stored entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.index.lock().remove(key);
        self.store.remove_item(&self.storage_key(key)).await
    }

    async fn clear(&self) -> Result<()> {
        self.index.lock().clear();
        for storage_key in self.store.get_all_keys().await? {
            if storage_key.starts_with(&self.config.namespace) {
                self.store.remove_item(&storage_key).await?;
            }
        }
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
            .filter(|(key, meta)| filter.matches(key, &meta.tags))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let expired = self
            .index
            .lock()
            .drain_where(|_, meta| now >= meta.expires_at);
        for (key, _) in &expired {
            self.remove_quietly(&self.storage_key(key)).await;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "[Persistent] Swept expired entries");
        }
        Ok(expired.len())
    }

    async fn evict_to(&self, target_bytes: u64) -> Result<usize> {
        let evicted = self.index.lock().evict_over(usize::MAX, target_bytes);
        let count = evicted.len();
        self.drop_evicted(evicted).await;
        Ok(count)
    }

    fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    async fn health_check(&self) -> bool {
        let probe = format!("{}__health_check", self.config.namespace);
        match self.store.set_item(&probe, "ok").await {
            Ok(()) => {
                let read_back = self.store.get_item(&probe).await;
                let _ = self.store.remove_item(&probe).await;
                matches!(read_back, Ok(Some(v)) if v == "ok")
            }
            Err(_) => false,
        }
    }

    fn kind(&self) -> TierKind {
        TierKind::Persistent
    }

    fn name(&self) -> &'static str {
        "PersistentKV"
    }
}

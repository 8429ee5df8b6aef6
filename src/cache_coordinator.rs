//! Cache Coordinator - Unified Cache Operations
//!
//! Orchestrates the memory, persistent and relational tiers: read-through
//! promotion, routed write fan-out, tag and pattern invalidation, background
//! cleanup and statistics. Every tier failure is logged and absorbed here; no
//! cache operation fails its caller.

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{CoordinatorConfig, WriteMode, decode_encryption_key};
use crate::entry::{CacheEntry, CachePriority, TierKind};
use crate::error::CoreError;
use crate::pattern::{GlobPattern, KeyFilter};
use crate::scheduler::Scheduler;
use crate::strategy::{EntityStrategy, StrategyTable};
use crate::traits::TierStore;
use crate::transform::PayloadTransformer;

/// Name of the cleanup task registered with the [`Scheduler`]
pub const CLEANUP_TASK: &str = "cache_cleanup";

/// RAII cleanup guard for in-flight request tracking
/// Ensures that entries are removed from `DashMap` even on early return or panic
struct InFlightGuard<'a> {
    map: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Clears a single-flight flag when the pass holding it ends
pub(crate) struct FlagGuard<'a>(pub(crate) &'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Newest write-behind scheduled for a key
#[derive(Debug, Default)]
struct PendingWrite {
    generation: u64,
    tags: BTreeSet<String>,
}

/// Serializes the write-behind of a key against later writes and removals
type WriteGate = Arc<tokio::sync::Mutex<PendingWrite>>;

/// Drop the gate for `key` once no write-behind task or caller still holds it
fn release_gate(gates: &DashMap<String, WriteGate>, key: &str, gate: WriteGate) {
    drop(gate);
    gates.remove_if(key, |_, g| Arc::strong_count(g) == 1);
}

/// The three tiers, fastest first
#[derive(Clone)]
pub struct Tiers {
    pub memory: Arc<dyn TierStore>,
    pub persistent: Arc<dyn TierStore>,
    pub relational: Arc<dyn TierStore>,
}

/// Per-call overrides for `get` and `set`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// TTL overriding the strategy and the global default
    pub ttl: Option<Duration>,
    pub priority: Option<CachePriority>,
    /// Tags added to the strategy's tags
    pub tags: Vec<String>,
    pub skip_memory: bool,
    pub skip_persistent: bool,
    pub skip_relational: bool,
    /// Whether compression is allowed; still only applied above the size threshold
    pub compress: Option<bool>,
    /// Force encryption on or off
    pub encrypt: Option<bool>,
}

impl CacheOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Leave `tier` out of this call
    #[must_use]
    pub fn skip(mut self, tier: TierKind) -> Self {
        match tier {
            TierKind::Memory => self.skip_memory = true,
            TierKind::Persistent => self.skip_persistent = true,
            TierKind::Relational => self.skip_relational = true,
        }
        self
    }

    #[must_use]
    pub fn with_compression(mut self, allowed: bool) -> Self {
        self.compress = Some(allowed);
        self
    }

    #[must_use]
    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = Some(encrypt);
        self
    }

    #[must_use]
    pub fn skips(&self, tier: TierKind) -> bool {
        match tier {
            TierKind::Memory => self.skip_memory,
            TierKind::Persistent => self.skip_persistent,
            TierKind::Relational => self.skip_relational,
        }
    }
}

/// Statistics for one tier
#[derive(Debug, Clone, PartialEq)]
pub struct TierStats {
    pub tier: TierKind,
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub bytes: u64,
    pub evictions: u64,
}

/// Coordinator statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub tiers: Vec<TierStats>,
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// Lifetime hit rate in percent
    pub hit_rate: f64,
    /// Hit rate over the most recent lookups, in percent
    pub rolling_hit_rate: f64,
    pub total_bytes: u64,
    pub total_entries: usize,
    pub promotions: u64,
    pub writes: u64,
    /// Tier failures absorbed by the coordinator
    pub storage_errors: u64,
    pub in_flight_requests: usize,
}

impl CacheStats {
    #[must_use]
    pub fn tier(&self, kind: TierKind) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.tier == kind)
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Another pass was already running; nothing was done
    pub skipped: bool,
    pub expired_removed: usize,
    pub pressure_evicted: usize,
    pub maintenance_failures: usize,
}

struct TierSlot {
    store: Arc<dyn TierStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TierSlot {
    fn new(store: Arc<dyn TierStore>) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

/// Cache Coordinator - one entry point over the three tiers
pub struct CacheCoordinator {
    memory: TierSlot,
    persistent: TierSlot,
    relational: TierSlot,
    /// Byte cap of the memory tier, the base of the pressure thresholds
    memory_capacity: u64,
    strategies: StrategyTable,
    transformer: PayloadTransformer,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    /// Statistics
    total_requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    writes: AtomicU64,
    storage_errors: Arc<AtomicU64>,
    recent: Mutex<VecDeque<bool>>,
    cleanup_running: AtomicBool,
    /// In-flight loads, to prevent a stampede on the same missing key
    in_flight_requests: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Keys with a write-behind that may still be running
    write_gates: Arc<DashMap<String, WriteGate>>,
}

impl CacheCoordinator {
    /// Create a coordinator over `tiers`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if the configured encryption key is malformed.
    pub fn new(
        tiers: Tiers,
        memory_capacity: u64,
        config: CoordinatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        let key = decode_encryption_key(config.encryption_key.as_deref())?;
        info!(
            memory = tiers.memory.name(),
            persistent = tiers.persistent.name(),
            relational = tiers.relational.name(),
            write_mode = ?config.write_mode,
            encryption = key.is_some(),
            "Initializing cache coordinator"
        );

        Ok(Self {
            memory: TierSlot::new(tiers.memory),
            persistent: TierSlot::new(tiers.persistent),
            relational: TierSlot::new(tiers.relational),
            memory_capacity,
            strategies: StrategyTable::default_table(),
            transformer: PayloadTransformer::new(key.as_ref()),
            recent: Mutex::new(VecDeque::with_capacity(config.stats_window)),
            config,
            clock,
            total_requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            storage_errors: Arc::new(AtomicU64::new(0)),
            cleanup_running: AtomicBool::new(false),
            in_flight_requests: DashMap::new(),
            write_gates: Arc::new(DashMap::new()),
        })
    }

    /// Replace the strategy table
    #[must_use]
    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.strategies = strategies;
        self
    }

    #[must_use]
    pub fn strategies(&self) -> &StrategyTable {
        &self.strategies
    }

    fn slot(&self, kind: TierKind) -> &TierSlot {
        match kind {
            TierKind::Memory => &self.memory,
            TierKind::Persistent => &self.persistent,
            TierKind::Relational => &self.relational,
        }
    }

    fn slots(&self) -> [&TierSlot; 3] {
        [&self.memory, &self.persistent, &self.relational]
    }

    fn storage_error(&self, tier: &dyn TierStore, op: &str, key: &str, error: &anyhow::Error) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
        warn!(tier = tier.name(), op, key = %key, error = %error, "Cache tier operation failed");
    }

    fn record_lookup(&self, hit: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        let mut recent = self.recent.lock();
        if recent.len() == self.config.stats_window {
            recent.pop_front();
        }
        recent.push_back(hit);
    }

    /// Get a value, consulting Memory, then Persistent, then Relational
    ///
    /// A hit in a lower tier is copied into every higher tier that was
    /// consulted and missed, keeping its original expiry.
    ///
    /// # Returns
    /// * `Some(value)` - Valid entry found and decoded as `T`
    /// * `None` - Miss in every consulted tier, or the stored value is not a `T`
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with(key, &CacheOptions::default()).await
    }

    /// [`get`](Self::get) honoring the tier-skip flags of `opts`
    pub async fn get_with<T: DeserializeOwned>(&self, key: &str, opts: &CacheOptions) -> Option<T> {
        let value = self.lookup(key, opts).await;
        self.record_lookup(value.is_some());
        decode_value(key, value?)
    }

    /// Tier walk with promotion; does not touch the lookup counters
    async fn lookup(&self, key: &str, opts: &CacheOptions) -> Option<serde_json::Value> {
        let mut missed: Vec<&TierSlot> = Vec::with_capacity(3);

        for kind in TierKind::ALL {
            if opts.skips(kind) {
                continue;
            }
            let slot = self.slot(kind);
            let entry = match slot.store.get(key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    slot.misses.fetch_add(1, Ordering::Relaxed);
                    missed.push(slot);
                    continue;
                }
                Err(e) => {
                    self.storage_error(slot.store.as_ref(), "get", key, &e);
                    slot.misses.fetch_add(1, Ordering::Relaxed);
                    missed.push(slot);
                    continue;
                }
            };

            let value = match self.transformer.open(&entry.envelope) {
                Ok(value) => value,
                Err(e) => {
                    // Unreadable with the current key; drop it so it is refetched
                    self.storage_error(slot.store.as_ref(), "open", key, &e);
                    if let Err(e) = slot.store.delete(key).await {
                        self.storage_error(slot.store.as_ref(), "delete", key, &e);
                    }
                    slot.misses.fetch_add(1, Ordering::Relaxed);
                    missed.push(slot);
                    continue;
                }
            };

            slot.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, tier = %kind, "Cache hit");
            self.promote(&entry, &missed).await;
            return Some(value);
        }

        debug!(key = %key, "Cache miss in every consulted tier");
        None
    }

    async fn promote(&self, entry: &CacheEntry, targets: &[&TierSlot]) {
        for slot in targets {
            match slot.store.set(entry.clone()).await {
                Ok(()) => {
                    self.promotions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %entry.key, tier = slot.store.name(), "Promoted entry");
                }
                Err(e) => self.storage_error(slot.store.as_ref(), "promote", &entry.key, &e),
            }
        }
    }

    /// Store a value with the strategy resolved from its key
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T) {
        self.set_with(key, data, &CacheOptions::default()).await;
    }

    /// Store a value
    ///
    /// TTL and priority come from `opts`, then the first matching strategy,
    /// then the global default. Target tiers:
    /// - Memory: `critical` priority or entries up to `small_entry_bytes`
    /// - Persistent: priority above `low`
    /// - Relational: always
    ///
    /// Stale copies in tiers the entry is no longer routed to are removed.
    /// A zero TTL removes the key everywhere. Never fails; storage errors are
    /// logged.
    pub async fn set_with<T: Serialize + ?Sized>(&self, key: &str, data: &T, opts: &CacheOptions) {
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                self.storage_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Value is not serializable; not cached");
                return;
            }
        };

        let strategy = self.strategies.lookup(key);
        let ttl = opts
            .ttl
            .or_else(|| strategy.map(|s| s.ttl))
            .unwrap_or(self.config.default_ttl);
        if ttl.is_zero() {
            self.delete(key).await;
            return;
        }

        let Some(entry) = self.build_entry(key, value, ttl, strategy, opts) else {
            return;
        };

        let targets = self.route(&entry, opts);
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.fan_out(entry, &targets).await;
    }

    fn build_entry(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
        strategy: Option<&EntityStrategy>,
        opts: &CacheOptions,
    ) -> Option<CacheEntry> {
        let priority = opts
            .priority
            .or_else(|| strategy.map(|s| s.priority))
            .unwrap_or_default();
        let encrypt = opts
            .encrypt
            .unwrap_or_else(|| strategy.is_some_and(|s| s.encrypt));
        let compress_allowed = opts
            .compress
            .unwrap_or_else(|| strategy.is_none_or(|s| s.compress));

        if encrypt && !self.transformer.can_encrypt() {
            self.storage_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, "Encryption required but no key configured; write refused");
            return None;
        }

        let raw_size = serde_json::to_vec(&value).map_or(0, |bytes| bytes.len() as u64);
        let compress = compress_allowed && raw_size > self.config.compression_threshold;

        let envelope = match self.transformer.seal(value, compress, encrypt) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.storage_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Failed to seal payload; not cached");
                return None;
            }
        };

        let tags = strategy
            .map(|s| s.tags.clone())
            .unwrap_or_default()
            .into_iter()
            .chain(opts.tags.iter().cloned());

        Some(
            CacheEntry::new(key, envelope, self.clock.now_millis(), ttl)
                .with_tags(tags)
                .with_priority(priority),
        )
    }

    fn route(&self, entry: &CacheEntry, opts: &CacheOptions) -> Vec<TierKind> {
        let wanted = |kind: TierKind| match kind {
            TierKind::Memory => {
                entry.priority == CachePriority::Critical
                    || entry.size_bytes <= self.config.small_entry_bytes
            }
            TierKind::Persistent => entry.priority > CachePriority::Low,
            TierKind::Relational => true,
        };
        TierKind::ALL
            .into_iter()
            .filter(|kind| !opts.skips(*kind) && wanted(*kind))
            .collect()
    }

    async fn fan_out(&self, entry: CacheEntry, targets: &[TierKind]) {
        let key = entry.key.clone();

        let (now, later): (Vec<TierKind>, Vec<TierKind>) = match self.config.write_mode {
            WriteMode::WriteThrough => (targets.to_vec(), Vec::new()),
            WriteMode::WriteBehind => match targets.split_first() {
                Some((first, rest)) => (vec![*first], rest.to_vec()),
                None => (Vec::new(), Vec::new()),
            },
        };

        // A newer write always supersedes an older pending write-behind
        let pending = if later.is_empty() {
            self.supersede(&key).await;
            None
        } else {
            let gate = self
                .write_gates
                .entry(key.clone())
                .or_insert_with(WriteGate::default)
                .clone();
            let generation = {
                let mut pending = gate.lock().await;
                pending.generation += 1;
                pending.tags.clone_from(&entry.tags);
                pending.generation
            };
            Some((gate, generation))
        };

        let stale = TierKind::ALL.into_iter().filter(|k| !targets.contains(k)).map(|kind| {
            let store = Arc::clone(&self.slot(kind).store);
            let key = key.clone();
            async move { (store.delete(&key).await, store) }
        });
        for (result, store) in join_all(stale).await {
            if let Err(e) = result {
                self.storage_error(store.as_ref(), "delete", &key, &e);
            }
        }

        let writes = now.iter().map(|kind| {
            let store = Arc::clone(&self.slot(*kind).store);
            let entry = entry.clone();
            async move { (store.set(entry).await, store) }
        });
        for (result, store) in join_all(writes).await {
            if let Err(e) = result {
                self.storage_error(store.as_ref(), "set", &key, &e);
            }
        }
        debug!(key = %key, tiers = ?targets, size_bytes = entry.size_bytes, "Cached entry");

        let Some((gate, generation)) = pending else {
            return;
        };
        let stores: Vec<Arc<dyn TierStore>> =
            later.iter().map(|k| Arc::clone(&self.slot(*k).store)).collect();
        let errors = Arc::clone(&self.storage_errors);
        let gates = Arc::clone(&self.write_gates);
        tokio::spawn(async move {
            {
                let pending = gate.lock().await;
                if pending.generation == generation {
                    for store in stores {
                        if let Err(e) = store.set(entry.clone()).await {
                            errors.fetch_add(1, Ordering::Relaxed);
                            warn!(tier = store.name(), key = %key, error = %e, "Write-behind failed");
                        }
                    }
                } else {
                    debug!(key = %key, "Write-behind superseded");
                }
            }
            release_gate(&gates, &key, gate);
        });
    }

    /// Cancel any pending write-behind of `key`, waiting out one already writing
    async fn supersede(&self, key: &str) {
        let Some(gate) = self.write_gates.get(key).map(|g| Arc::clone(g.value())) else {
            return;
        };
        gate.lock().await.generation += 1;
        release_gate(&self.write_gates, key, gate);
    }

    /// Cancel every pending write-behind whose key or tags match `filter`
    async fn supersede_matching(&self, filter: Option<&KeyFilter>) {
        let gates: Vec<(String, WriteGate)> = self
            .write_gates
            .iter()
            .map(|g| (g.key().clone(), Arc::clone(g.value())))
            .collect();
        for (key, gate) in gates {
            {
                let mut pending = gate.lock().await;
                if filter.is_none_or(|f| f.matches(&key, &pending.tags)) {
                    pending.generation += 1;
                }
            }
            release_gate(&self.write_gates, &key, gate);
        }
    }

    /// Remove `key` from every tier
    pub async fn delete(&self, key: &str) {
        self.supersede(key).await;
        for slot in self.slots() {
            if let Err(e) = slot.store.delete(key).await {
                self.storage_error(slot.store.as_ref(), "delete", key, &e);
            }
        }
    }

    /// Empty every tier
    pub async fn clear(&self) {
        self.supersede_matching(None).await;
        for slot in self.slots() {
            if let Err(e) = slot.store.clear().await {
                self.storage_error(slot.store.as_ref(), "clear", "*", &e);
            }
        }
        info!("Cleared all cache tiers");
    }

    /// Remove every entry carrying any of `tags`; returns the number of distinct keys removed
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        if tags.is_empty() {
            return 0;
        }
        self.invalidate(&KeyFilter::Tags(tags.to_vec())).await
    }

    /// Remove every entry whose key matches the glob; an invalid glob removes nothing
    pub async fn invalidate_pattern(&self, glob: &str) -> usize {
        match GlobPattern::new(glob) {
            Ok(pattern) => self.invalidate(&KeyFilter::Pattern(pattern)).await,
            Err(e) => {
                warn!(pattern = %glob, error = %e, "Invalid invalidation pattern");
                0
            }
        }
    }

    async fn invalidate(&self, filter: &KeyFilter) -> usize {
        self.supersede_matching(Some(filter)).await;
        let mut keys = BTreeSet::new();
        for slot in self.slots() {
            match slot.store.find_by_tag_or_pattern(filter).await {
                Ok(found) => keys.extend(found),
                Err(e) => self.storage_error(slot.store.as_ref(), "find", "*", &e),
            }
        }

        for slot in [&self.memory, &self.persistent] {
            for key in &keys {
                if let Err(e) = slot.store.delete(key).await {
                    self.storage_error(slot.store.as_ref(), "delete", key, &e);
                }
            }
        }
        if let Err(e) = self.relational.store.delete_matching(filter).await {
            self.storage_error(self.relational.store.as_ref(), "delete_matching", "*", &e);
        }

        if !keys.is_empty() {
            info!(count = keys.len(), filter = ?filter, "Invalidated cache entries");
        }
        keys.len()
    }

    /// Get a value, loading and caching it on a miss
    ///
    /// Concurrent misses for the same key are coalesced: one caller runs
    /// `fetch`, the others wait and then read the cached result. A `null`
    /// result is returned but not cached.
    ///
    /// # Errors
    ///
    /// Returns the loader's error; cache failures never surface.
    pub async fn get_or_fetch<T, E, F, Fut>(&self, key: &str, opts: &CacheOptions, fetch: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.get_or_fetch_tracked(key, opts, fetch)
            .await
            .map(|(value, _)| value)
    }

    /// [`get_or_fetch`](Self::get_or_fetch), also reporting whether the value came from cache
    pub(crate) async fn get_or_fetch_tracked<T, E, F, Fut>(
        &self,
        key: &str,
        opts: &CacheOptions,
        fetch: F,
    ) -> Result<(T, bool), E>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        if let Some(value) = self.get_with::<T>(key, opts).await {
            return Ok((value, true));
        }

        let lock = self
            .in_flight_requests
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _cleanup = InFlightGuard {
            map: &self.in_flight_requests,
            key: key.to_string(),
        };
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let guard = lock.lock().await;
                // Another caller was loading it while we waited
                if let Some(value) = self.lookup(key, opts).await.and_then(|v| decode_value::<T>(key, v)) {
                    return Ok((value, true));
                }
                guard
            }
        };

        debug!(key = %key, "Loading value (coalesced)");
        let value = fetch().await?;
        if serde_json::to_value(&value).is_ok_and(|v| !v.is_null()) {
            self.set_with(key, &value, opts).await;
        }
        Ok((value, false))
    }

    /// Number of keys currently being loaded through [`get_or_fetch`](Self::get_or_fetch)
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight_requests.len()
    }

    /// Get comprehensive cache statistics
    pub async fn get_stats(&self) -> CacheStats {
        let mut tiers = Vec::with_capacity(3);
        for (kind, slot) in TierKind::ALL.into_iter().zip(self.slots()) {
            let entries = slot.store.entry_count().await.unwrap_or(0);
            let bytes = slot.store.current_size().await.unwrap_or(0);
            tiers.push(TierStats {
                tier: kind,
                backend: slot.store.name(),
                hits: slot.hits.load(Ordering::Relaxed),
                misses: slot.misses.load(Ordering::Relaxed),
                entries,
                bytes,
                evictions: slot.store.eviction_count(),
            });
        }

        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        let rolling_hit_rate = {
            let recent = self.recent.lock();
            percent(recent.iter().filter(|hit| **hit).count() as u64, recent.len() as u64)
        };

        CacheStats {
            total_bytes: tiers.iter().map(|t| t.bytes).sum(),
            total_entries: tiers.iter().map(|t| t.entries).sum(),
            tiers,
            total_requests,
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: percent(hits, total_requests),
            rolling_hit_rate,
            promotions: self.promotions.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            in_flight_requests: self.in_flight_requests.len(),
        }
    }

    /// One cleanup pass: TTL sweep, memory-pressure eviction, tier maintenance
    ///
    /// Single-flight: a call made while a pass is running returns a report
    /// with `skipped` set.
    pub async fn run_cleanup(&self) -> CleanupReport {
        if self
            .cleanup_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Cleanup already running; skipping");
            return CleanupReport {
                skipped: true,
                ..CleanupReport::default()
            };
        }
        let _flag = FlagGuard(&self.cleanup_running);
        let mut report = CleanupReport::default();

        for slot in self.slots() {
            match slot.store.sweep_expired().await {
                Ok(removed) => report.expired_removed += removed,
                Err(e) => self.storage_error(slot.store.as_ref(), "sweep", "*", &e),
            }
        }

        let threshold = fraction_of(self.memory_capacity, self.config.pressure_threshold);
        match self.memory.store.current_size().await {
            Ok(used) if used > threshold => {
                let target = fraction_of(self.memory_capacity, self.config.pressure_target);
                match self.memory.store.evict_to(target).await {
                    Ok(evicted) => {
                        report.pressure_evicted = evicted;
                        info!(used, target, evicted, "Memory pressure eviction");
                    }
                    Err(e) => self.storage_error(self.memory.store.as_ref(), "evict", "*", &e),
                }
            }
            Ok(_) => {}
            Err(e) => self.storage_error(self.memory.store.as_ref(), "size", "*", &e),
        }

        for slot in self.slots() {
            if let Err(e) = slot.store.maintenance().await {
                report.maintenance_failures += 1;
                self.storage_error(slot.store.as_ref(), "maintenance", "*", &e);
            }
        }

        info!(
            expired = report.expired_removed,
            evicted = report.pressure_evicted,
            "Cache cleanup finished"
        );
        report
    }

    /// Run [`run_cleanup`](Self::run_cleanup) every `cleanup_interval`
    pub fn start_background_cleanup(self: &Arc<Self>, scheduler: &Scheduler) {
        let weak = Arc::downgrade(self);
        scheduler.every(CLEANUP_TASK, self.config.cleanup_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.run_cleanup().await;
                }
            }
        });
    }

    /// Probe every tier; `true` when all are healthy
    pub async fn health_check(&self) -> bool {
        let mut healthy = true;
        for slot in self.slots() {
            let ok = slot.store.health_check().await;
            if !ok {
                warn!(tier = slot.store.name(), "Cache tier health check failed");
            }
            healthy &= ok;
        }
        if healthy {
            debug!("Cache health check passed");
        }
        healthy
    }
}

fn decode_value<T: DeserializeOwned>(key: &str, value: serde_json::Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(typed) => Some(typed),
        Err(e) => {
            warn!(key = %key, error = %e, target_type = std::any::type_name::<T>(), "Cached value has unexpected shape");
            None
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn fraction_of(capacity: u64, fraction: f64) -> u64 {
    (capacity as f64 * fraction) as u64
}

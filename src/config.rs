//! Configuration
//!
//! One struct per component, aggregated by [`CoreConfig`]. Every struct has a
//! `Default` and deserializes from JSON with missing fields defaulted;
//! durations are written as milliseconds.
//!
//! ```rust
//! use offline_cache_sync::config::CoreConfig;
//!
//! let config: CoreConfig = serde_json::from_str(r#"{
//!     "memory": { "max_entries": 200 },
//!     "coordinator": { "cleanup_interval": 60000 }
//! }"#).unwrap();
//! assert_eq!(config.memory.max_entries, 200);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::CoreError;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Serde adapter writing a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::clock::duration_millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_bytes: 10 * MIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentTierConfig {
    /// Prefix of every storage key written by the tier
    pub namespace: String,
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for PersistentTierConfig {
    fn default() -> Self {
        Self {
            namespace: "cache:".to_string(),
            max_entries: 2_000,
            max_bytes: 50 * MIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalTierConfig {
    /// Database file; `None` keeps the database in memory
    pub path: Option<PathBuf>,
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for RelationalTierConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_entries: 20_000,
            max_bytes: 200 * MIB,
        }
    }
}

/// How `set` fans out to the selected tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Await every selected tier
    #[default]
    WriteThrough,
    /// Await the fastest selected tier; slower tiers are written on a spawned task
    WriteBehind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// TTL used when neither the call nor a strategy names one
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    /// Payloads larger than this are compressed when the strategy allows it
    pub compression_threshold: u64,
    /// Entries at or below this size are kept in the memory tier
    pub small_entry_bytes: u64,
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Fraction of the memory tier's byte cap that triggers pressure eviction
    pub pressure_threshold: f64,
    /// Fraction of the cap pressure eviction shrinks the memory tier to
    pub pressure_target: f64,
    pub write_mode: WriteMode,
    /// Number of recent lookups behind the rolling hit rate
    pub stats_window: usize,
    /// Hex-encoded 32-byte AES-256 key; encrypted strategies refuse writes without one
    #[serde(skip_serializing)]
    pub encryption_key: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            compression_threshold: 10 * KIB,
            small_entry_bytes: 4 * KIB,
            cleanup_interval: Duration::from_secs(5 * 60),
            pressure_threshold: 0.8,
            pressure_target: 0.7,
            write_mode: WriteMode::WriteThrough,
            stats_window: 100,
            encryption_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Attempts after the first one for retryable failures
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub retry_max_delay: Duration,
    /// Calls slower than this are logged and counted as slow
    #[serde(with = "duration_ms")]
    pub slow_query_threshold: Duration,
    /// Size of the per-call metrics ring buffer
    pub metrics_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            slow_query_threshold: Duration::from_secs(2),
            metrics_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    /// Operations replayed concurrently per batch
    pub batch_size: usize,
    pub default_max_retries: u32,
    /// Operations older than this are dropped by `cleanup_stale`
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Prefix of the durable keys the queue writes
    pub storage_prefix: String,
    /// Automatic resolutions kept for `get_conflict_history`
    pub conflict_history: usize,
    /// Server-owned fields kept from the remote record on merge, beyond the built-in ones
    pub extra_system_fields: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            batch_size: 5,
            default_max_retries: 3,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            storage_prefix: "offline_queue:".to_string(),
            conflict_history: 100,
            extra_system_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_reconnect_attempts: u32,
    #[serde(with = "duration_ms")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_max_delay: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    /// Deadline for a single connectivity probe
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for change-notification driven invalidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    pub enabled: bool,
    /// Tables to watch; empty watches every table the backend reports
    pub tables: Vec<String>,
    /// Cache tags invalidated per table; unmapped tables invalidate the tag named after the table
    pub table_tags: BTreeMap<String, Vec<String>>,
    #[serde(with = "duration_ms")]
    pub resubscribe_delay: Duration,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tables: Vec::new(),
            table_tags: BTreeMap::new(),
            resubscribe_delay: Duration::from_secs(5),
        }
    }
}

impl InvalidationConfig {
    /// Cache tags to drop when `table` changes
    #[must_use]
    pub fn tags_for(&self, table: &str) -> Vec<String> {
        self.table_tags
            .get(table)
            .cloned()
            .unwrap_or_else(|| vec![table.to_string()])
    }
}

/// Whole-core configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub memory: MemoryTierConfig,
    pub persistent: PersistentTierConfig,
    pub relational: RelationalTierConfig,
    pub coordinator: CoordinatorConfig,
    pub executor: ExecutorConfig,
    pub queue: QueueConfig,
    pub supervisor: SupervisorConfig,
    pub invalidation: InvalidationConfig,
    /// Filter directive for [`crate::init_tracing`] when `RUST_LOG` is unset
    pub log_level: Option<String>,
}

impl CoreConfig {
    /// Defaults overlaid with `OFFLINE_CACHE_*` environment variables
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `OFFLINE_CACHE_DB_PATH` | `relational.path` |
    /// | `OFFLINE_CACHE_ENCRYPTION_KEY` | `coordinator.encryption_key` |
    /// | `OFFLINE_CACHE_MEMORY_MAX_ENTRIES` | `memory.max_entries` |
    /// | `OFFLINE_CACHE_MEMORY_MAX_BYTES` | `memory.max_bytes` |
    /// | `OFFLINE_CACHE_QUEUE_MAX_SIZE` | `queue.max_queue_size` |
    /// | `OFFLINE_CACHE_LOG` | `log_level` |
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if a numeric variable does not parse or
    /// the result fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let mut config = Self::default();

        if let Some(path) = lookup("OFFLINE_CACHE_DB_PATH") {
            config.relational.path = Some(PathBuf::from(path));
        }
        if let Some(key) = lookup("OFFLINE_CACHE_ENCRYPTION_KEY") {
            config.coordinator.encryption_key = Some(key);
        }
        if let Some(raw) = lookup("OFFLINE_CACHE_MEMORY_MAX_ENTRIES") {
            config.memory.max_entries = parse_var("OFFLINE_CACHE_MEMORY_MAX_ENTRIES", &raw)?;
        }
        if let Some(raw) = lookup("OFFLINE_CACHE_MEMORY_MAX_BYTES") {
            config.memory.max_bytes = parse_var("OFFLINE_CACHE_MEMORY_MAX_BYTES", &raw)?;
        }
        if let Some(raw) = lookup("OFFLINE_CACHE_QUEUE_MAX_SIZE") {
            config.queue.max_queue_size = parse_var("OFFLINE_CACHE_QUEUE_MAX_SIZE", &raw)?;
        }
        if let Some(level) = lookup("OFFLINE_CACHE_LOG") {
            config.log_level = Some(level);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the core cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        let bounds = [
            ("memory", self.memory.max_entries, self.memory.max_bytes),
            ("persistent", self.persistent.max_entries, self.persistent.max_bytes),
            ("relational", self.relational.max_entries, self.relational.max_bytes),
        ];
        for (tier, entries, bytes) in bounds {
            if entries == 0 || bytes == 0 {
                return Err(CoreError::config(format!("{tier} tier bounds must be non-zero")));
            }
        }

        let c = &self.coordinator;
        if !(c.pressure_threshold > 0.0 && c.pressure_threshold <= 1.0) {
            return Err(CoreError::config("pressure_threshold must be within (0, 1]"));
        }
        if !(c.pressure_target > 0.0 && c.pressure_target < c.pressure_threshold) {
            return Err(CoreError::config(
                "pressure_target must be positive and below pressure_threshold",
            ));
        }
        if c.default_ttl.is_zero() {
            return Err(CoreError::config("default_ttl must be non-zero"));
        }
        if c.cleanup_interval.is_zero() {
            return Err(CoreError::config("cleanup_interval must be non-zero"));
        }
        if c.stats_window == 0 {
            return Err(CoreError::config("stats_window must be non-zero"));
        }
        self.encryption_key()?;

        if self.executor.metrics_capacity == 0 {
            return Err(CoreError::config("metrics_capacity must be non-zero"));
        }
        // Both live in the same key-value store; cache load and clear own every key under the namespace
        let (namespace, queue_prefix) = (&self.persistent.namespace, &self.queue.storage_prefix);
        if namespace.is_empty() || queue_prefix.is_empty() {
            return Err(CoreError::config("persistent namespace and queue storage_prefix must be non-empty"));
        }
        if namespace.starts_with(queue_prefix.as_str()) || queue_prefix.starts_with(namespace.as_str()) {
            return Err(CoreError::config(format!(
                "persistent namespace {namespace:?} overlaps queue storage_prefix {queue_prefix:?}"
            )));
        }
        if self.queue.batch_size == 0 || self.queue.max_queue_size == 0 {
            return Err(CoreError::config("queue batch_size and max_queue_size must be non-zero"));
        }
        if self.supervisor.health_check_interval.is_zero() {
            return Err(CoreError::config("health_check_interval must be non-zero"));
        }
        if self.supervisor.reconnect_base_delay > self.supervisor.reconnect_max_delay {
            return Err(CoreError::config("reconnect_base_delay exceeds reconnect_max_delay"));
        }
        Ok(())
    }

    /// Decoded encryption key, if one is configured
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if the key is not 64 hex characters.
    pub fn encryption_key(&self) -> Result<Option<[u8; 32]>, CoreError> {
        decode_encryption_key(self.coordinator.encryption_key.as_deref())
    }
}

pub(crate) fn decode_encryption_key(hex_key: Option<&str>) -> Result<Option<[u8; 32]>, CoreError> {
    let Some(hex_key) = hex_key else {
        return Ok(None);
    };
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| CoreError::config(format!("encryption key is not valid hex: {e}")))?;
    let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        CoreError::config(format!("encryption key must be 32 bytes, got {}", b.len()))
    })?;
    Ok(Some(key))
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, CoreError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| CoreError::config(format!("{name}={raw:?}: {e}")))
}

//! Storage Traits
//!
//! This module defines the abstractions the cache core is written against,
//! so each tier and each durable store can be swapped without touching the
//! coordinator.
//!
//! # Architecture
//!
//! - `CacheCodec`: Trait for pluggable serialization of durable records
//! - `TierStore`: Core trait implemented by the memory, persistent and relational tiers
//! - `KeyValueStore`: Opaque string-keyed blob store backing the persistent tier and the offline queue
//!
//! # Example: Custom Tier
//!
//! ```rust,ignore
//! use offline_cache_sync::{TierStore, CacheEntry, KeyFilter, TierKind, async_trait};
//! use anyhow::Result;
//!
//! struct MyTier {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl TierStore for MyTier {
//!     async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
//!         // Your implementation
//!     }
//!
//!     async fn set(&self, entry: CacheEntry) -> Result<()> {
//!         // Your implementation
//!     }
//!
//!     // ...
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

use crate::entry::{CacheEntry, TierKind};
use crate::pattern::KeyFilter;

/// Trait for record serialization/deserialization
///
/// Used wherever a structured record is written to a [`KeyValueStore`]:
/// persistent-tier entries, queued operations, conflict records.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access across async tasks
/// and provide debugging capabilities.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to a string
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by this codec.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<String>;

    /// Deserialize a string back into a value
    ///
    /// # Errors
    ///
    /// Returns an error if the input is malformed or does not match `T`.
    fn decode<T: DeserializeOwned>(&self, raw: &str) -> Result<T>;

    /// Get the name of the codec
    ///
    /// This is used for logging and debugging purposes.
    fn name(&self) -> &'static str;
}

/// Core trait for one cache tier
///
/// Tiers are passive storage: the coordinator decides what goes where and
/// owns every entry. A tier only enforces its own bounds and TTL validity.
///
/// # Required Behavior
///
/// - `get` on an expired-but-present entry is a miss and removes the entry
/// - `set` beyond capacity evicts least-recently-accessed entries until
///   both the entry-count and byte bounds hold
/// - `delete` and `clear` succeed when the key or tier is already empty
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to support concurrent access across async tasks.
#[async_trait]
pub trait TierStore: Send + Sync {
    /// Get an entry by key
    ///
    /// # Returns
    ///
    /// * `Ok(Some(entry))` - Valid entry found; its access bookkeeping was updated
    /// * `Ok(None)` - Key not found or expired
    /// * `Err(e)` - Storage failure
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry under `entry.key`, replacing any previous value
    async fn set(&self, entry: CacheEntry) -> Result<()>;

    /// Remove an entry (no-op if absent)
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every entry of this tier
    async fn clear(&self) -> Result<()>;

    /// Total estimated size in bytes of the stored entries
    async fn current_size(&self) -> Result<u64>;

    /// Number of stored entries
    async fn entry_count(&self) -> Result<usize>;

    /// Keys matching a tag set or glob pattern.
    ///
    /// Authoritative for the relational tier, a best-effort scan elsewhere.
    async fn find_by_tag_or_pattern(&self, filter: &KeyFilter) -> Result<Vec<String>>;

    /// Remove every entry matching the filter, returning how many were removed
    async fn delete_matching(&self, filter: &KeyFilter) -> Result<usize> {
        let keys = self.find_by_tag_or_pattern(filter).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }

    /// Remove every expired entry, returning how many were dropped
    async fn sweep_expired(&self) -> Result<usize>;

    /// Evict least-recently-accessed entries until the tier holds at most
    /// `target_bytes`. Returns the number of evicted entries.
    async fn evict_to(&self, target_bytes: u64) -> Result<usize>;

    /// Compaction and statistics refresh; no-op for tiers without one
    async fn maintenance(&self) -> Result<()> {
        Ok(())
    }

    /// Total entries this tier has evicted under pressure since start
    fn eviction_count(&self) -> u64;

    /// Check if the tier is operational
    async fn health_check(&self) -> bool;

    /// Which tier this store implements
    fn kind(&self) -> TierKind;

    /// Get the name of this tier backend
    ///
    /// This is used for logging and debugging purposes.
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Durable small-value storage
///
/// An opaque string-keyed blob store (the platform's app-private key-value
/// storage). Used by the persistent tier and by the offline queue.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_item(&self, key: &str) -> Result<()>;

    async fn get_all_keys(&self) -> Result<Vec<String>>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}

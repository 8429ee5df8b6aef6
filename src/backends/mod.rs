//! Tier Backend Implementations
//!
//! This module contains the three cache tiers and the durable key-value
//! stores the persistent tier is written against.
//!
//! # Available Tiers
//!
//! - **Memory** - bounded strict-LRU map, the fastest tier
//! - **Persistent** - JSON records in a [`KeyValueStore`](crate::traits::KeyValueStore)
//! - **Relational** - embedded SQLite, the tier of record
//!
//! # Key-Value Stores
//!
//! - **`MemoryKeyValueStore`** - `DashMap`-backed, for tests and bridged hosts
//! - **`FileKeyValueStore`** - one file per key in an app-private directory
//!
//! # Usage
//!
//! ```rust,no_run
//! use offline_cache_sync::backends::{MemoryKeyValueStore, PersistentTier, RelationalTier};
//! use offline_cache_sync::clock::SystemClock;
//! use offline_cache_sync::config::{PersistentTierConfig, RelationalTierConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let clock = Arc::new(SystemClock);
//! let persistent = PersistentTier::new(
//!     Arc::new(MemoryKeyValueStore::new()),
//!     PersistentTierConfig::default(),
//!     clock.clone(),
//! );
//! persistent.load().await?;
//!
//! let relational = RelationalTier::open(RelationalTierConfig::default(), clock)?;
//! # Ok(())
//! # }
//! ```

mod lru;

pub mod kv_store;
pub mod memory_tier;
pub mod persistent_tier;
pub mod relational_tier;

pub use kv_store::{FileKeyValueStore, MemoryKeyValueStore};
pub use memory_tier::MemoryTier;
pub use persistent_tier::{LoadReport, PersistentTier};
pub use relational_tier::RelationalTier;

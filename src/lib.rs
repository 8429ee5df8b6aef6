//! Offline Cache Sync
//!
//! Client-side caching and offline-sync core for apps that must keep working
//! without a network:
//! - **Three cache tiers**: bounded in-memory LRU, a persistent key-value
//!   tier and an embedded SQLite tier, with promotion on hit
//! - **Network-aware queries**: timeouts, retries and batching tuned to the
//!   current connection quality
//! - **Offline write queue**: prioritized, durable, replayed on reconnect
//!   with conflict detection and resolution
//! - **Connection supervision**: health checks and exponential-backoff
//!   reconnects
//! - **Change-driven invalidation** from the backend's row-change stream
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use offline_cache_sync::{QueryOptions, SyncCore};
//! use std::sync::Arc;
//!
//! offline_cache_sync::init_tracing();
//! let core = SyncCore::builder(Arc::new(MyBackend::new())).build()?;
//! core.init().await?;
//!
//! let lesson = core
//!     .executor()
//!     .execute("lesson_content:42", || backend.fetch_lesson(42), &QueryOptions::new())
//!     .await;
//! ```
//!
//! # Architecture
//!
//! ```text
//! execute -> Memory -> Persistent -> Relational -> remote (retry/timeout)
//!            hit       promote       promote       store per strategy
//!
//! execute_mutation -> remote ─ offline ─> OfflineQueue ── reconnect ──> replay
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod backends;
pub mod builder;
pub mod cache_coordinator;
pub mod clock;
pub mod codecs;
pub mod config;
pub mod conflict;
pub mod entry;
pub mod error;
pub mod invalidation;
pub mod metrics;
pub mod network;
pub mod offline_queue;
pub mod pattern;
pub mod query_executor;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod strategy;
pub mod supervisor;
pub mod traits;
pub mod transform;

pub use backends::{FileKeyValueStore, MemoryKeyValueStore, PersistentTier};
pub use builder::SyncCoreBuilder;
pub use cache_coordinator::{CacheCoordinator, CacheOptions, CacheStats, CleanupReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoreConfig;
pub use conflict::{ConflictKind, ConflictRecord, ConflictResolution, ResolutionStrategy};
pub use entry::CachePriority;
pub use error::{CoreError, ErrorKind, QueryError};
pub use invalidation::{ChangeSubscriber, InvalidationStats};
pub use metrics::{QueryMetric, QueryStats};
pub use network::{
    ConnectionQuality, ConnectionType, ConnectivityClass, ConnectivitySignal, ConnectivityState,
    EffectiveSpeed, NetworkMonitor, NetworkProfile,
};
pub use offline_queue::{
    EnqueueOptions, OfflineQueue, OperationPriority, QueueStatus, QueuedOperation, ReplayReport,
};
pub use query_executor::{BatchQuery, MutationOptions, QueryExecutor, QueryOptions, QueryResult};
pub use remote::{AuthRefresher, ChangeEvent, ChangeFilter, ChangeStream, Mutation, MutationKind, RemoteLink};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use supervisor::{ConnectionState, ConnectionStatus, ConnectionSupervisor};
pub use traits::{KeyValueStore, TierStore};

// Re-export async_trait for implementors of RemoteLink and the stores
pub use async_trait::async_trait;

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG` (default `info`)
///
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing() {
    init_tracing_with("info");
}

/// Like [`init_tracing`] with an explicit fallback directive
pub fn init_tracing_with(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Outcome of [`SyncCore::init`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    /// Entries restored into the persistent tier
    pub restored_entries: usize,
    /// Operations restored into the offline queue
    pub pending_operations: usize,
    /// Whether the first connection attempt succeeded
    pub connected: bool,
}

/// Service container
///
/// Every service is constructed once by [`SyncCoreBuilder`] and shared by
/// `Arc`; cloning the container is cheap.
#[derive(Clone)]
pub struct SyncCore {
    pub(crate) cache: Arc<CacheCoordinator>,
    pub(crate) monitor: Arc<NetworkMonitor>,
    pub(crate) queue: Arc<OfflineQueue>,
    pub(crate) executor: Arc<QueryExecutor>,
    pub(crate) supervisor: Arc<ConnectionSupervisor>,
    pub(crate) persistent: Arc<PersistentTier>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) subscriber: Option<Arc<ChangeSubscriber>>,
    pub(crate) subscriber_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncCore {
    #[must_use]
    pub fn builder(remote: Arc<dyn RemoteLink>) -> SyncCoreBuilder {
        SyncCoreBuilder::new(remote)
    }

    /// Restore durable state, start background tasks and connect
    ///
    /// A failed first connection is not an error: the supervisor keeps
    /// reconnecting in the background.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Storage`] if the persistent tier or the queue
    /// cannot read their key-value store.
    pub async fn init(&self) -> Result<InitReport, CoreError> {
        info!("Initializing sync core");
        let loaded = self.persistent.load().await?;
        let pending_operations = self.queue.init().await?;

        self.cache.start_background_cleanup(&self.scheduler);
        self.queue.start_retention_cleanup(&self.scheduler);
        self.supervisor.start_health_checks(&self.scheduler);

        if let Some(subscriber) = &self.subscriber {
            let mut task = self.subscriber_task.lock();
            if task.is_none() {
                *task = Some(subscriber.start());
            }
        }

        let connected = self.supervisor.connect().await;
        let report = InitReport {
            restored_entries: loaded.loaded,
            pending_operations,
            connected,
        };
        info!(
            restored = report.restored_entries,
            pending = report.pending_operations,
            connected,
            "Sync core initialized"
        );
        Ok(report)
    }

    /// Cancel every scheduled task, the reconnect loop and the change subscriber
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.supervisor.shutdown();
        if let Some(subscriber) = &self.subscriber {
            subscriber.shutdown();
        }
        if let Some(task) = self.subscriber_task.lock().take() {
            task.abort();
        }
        info!("Sync core shut down");
    }

    pub async fn on_app_foreground(&self) {
        self.supervisor.set_foreground(true).await;
    }

    pub async fn on_app_background(&self) {
        self.supervisor.set_foreground(false).await;
    }

    /// Forward an OS connectivity callback
    pub async fn handle_connectivity_signal(&self, signal: ConnectivitySignal) {
        self.supervisor.handle_connectivity_signal(signal).await;
    }

    /// Probe every cache tier
    pub async fn health_check(&self) -> bool {
        self.cache.health_check().await
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheCoordinator> {
        &self.cache
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn change_subscriber(&self) -> Option<&Arc<ChangeSubscriber>> {
        self.subscriber.as_ref()
    }
}

//! Sync Core Builder
//!
//! Wires every service exactly once and hands them out as shared `Arc`s.
//!
//! # Example
//!
//! ```rust,ignore
//! use offline_cache_sync::{CoreConfig, SyncCore};
//! use std::sync::Arc;
//!
//! let core = SyncCore::builder(Arc::new(MyBackend::new()))
//!     .with_config(CoreConfig::from_env()?)
//!     .with_key_value_store(Arc::new(FileKeyValueStore::open(data_dir).await?))
//!     .build()?;
//! core.init().await?;
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backends::{MemoryKeyValueStore, MemoryTier, PersistentTier, RelationalTier};
use crate::cache_coordinator::{CacheCoordinator, Tiers};
use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::invalidation::ChangeSubscriber;
use crate::network::NetworkMonitor;
use crate::offline_queue::OfflineQueue;
use crate::query_executor::QueryExecutor;
use crate::remote::{AuthRefresher, RemoteLink};
use crate::scheduler::Scheduler;
use crate::supervisor::ConnectionSupervisor;
use crate::traits::KeyValueStore;
use crate::SyncCore;

/// Builder for [`SyncCore`]
///
/// Only the remote link is required. Without a key-value store the
/// persistent tier and the offline queue live in memory and do not survive
/// a restart.
pub struct SyncCoreBuilder {
    remote: Arc<dyn RemoteLink>,
    config: CoreConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    auth: Option<Arc<dyn AuthRefresher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SyncCoreBuilder {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteLink>) -> Self {
        Self {
            remote,
            config: CoreConfig::default(),
            store: None,
            auth: None,
            clock: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Platform key-value store backing the persistent tier and the queue
    #[must_use]
    pub fn with_key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Session refresher used when the backend reports an expired session
    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn AuthRefresher>) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Construct every service
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] for invalid configuration and
    /// [`CoreError::Storage`] if the relational store cannot be opened.
    pub fn build(self) -> Result<SyncCore, CoreError> {
        let Self {
            remote,
            config,
            store,
            auth,
            clock,
        } = self;
        config.validate()?;

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = store.unwrap_or_else(|| {
            warn!("No key-value store configured; persistent tier and offline queue are not durable");
            Arc::new(MemoryKeyValueStore::new())
        });

        let persistent = Arc::new(PersistentTier::new(
            Arc::clone(&store),
            config.persistent.clone(),
            clock.clone(),
        ));
        let relational = Arc::new(RelationalTier::open(config.relational.clone(), clock.clone())?);
        let tiers = Tiers {
            memory: Arc::new(MemoryTier::new(config.memory.clone(), clock.clone())),
            persistent: persistent.clone(),
            relational,
        };
        let cache = Arc::new(CacheCoordinator::new(
            tiers,
            config.memory.max_bytes,
            config.coordinator.clone(),
            clock.clone(),
        )?);

        let monitor = Arc::new(NetworkMonitor::new(clock.clone()));
        let queue = Arc::new(
            OfflineQueue::new(
                store,
                remote.clone(),
                monitor.clone(),
                config.queue.clone(),
                clock.clone(),
            )
            .with_cache(cache.clone()),
        );

        let mut executor = QueryExecutor::new(
            cache.clone(),
            monitor.clone(),
            queue.clone(),
            remote.clone(),
            &config.executor,
            clock.clone(),
        );
        if let Some(auth) = auth {
            executor = executor.with_auth(auth);
        }

        let supervisor = ConnectionSupervisor::new(
            remote.clone(),
            monitor.clone(),
            queue.clone(),
            config.supervisor.clone(),
            clock,
        );

        let subscriber = config
            .invalidation
            .enabled
            .then(|| Arc::new(ChangeSubscriber::new(remote.clone(), cache.clone(), config.invalidation.clone())));

        info!(
            remote = remote.name(),
            invalidation = subscriber.is_some(),
            "Sync core constructed"
        );

        Ok(SyncCore {
            cache,
            monitor,
            queue,
            executor: Arc::new(executor),
            supervisor,
            persistent,
            scheduler: Arc::new(Scheduler::new()),
            subscriber,
            subscriber_task: Arc::new(Mutex::new(None)),
        })
    }
}

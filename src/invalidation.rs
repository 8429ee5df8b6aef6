//! Change-notification driven invalidation
//!
//! Listens to the backend's row-change stream and drops the cache tags mapped
//! from each changed table. A failed or ended stream is resubscribed after a
//! fixed delay until shutdown.

use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache_coordinator::CacheCoordinator;
use crate::config::InvalidationConfig;
use crate::error::QueryError;
use crate::remote::{ChangeEvent, ChangeFilter, RemoteLink};

/// Statistics for change-driven invalidation
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationStats {
    /// Row events received from the backend
    pub events_received: u64,
    /// Events ignored because their table is not watched
    pub events_ignored: u64,
    /// Cache entries dropped as a result of events
    pub entries_invalidated: u64,
    /// Successful (re)subscriptions
    pub subscriptions: u64,
    /// Subscribe failures and stream errors
    pub stream_errors: u64,
}

#[derive(Debug, Default)]
struct AtomicInvalidationStats {
    events_received: AtomicU64,
    events_ignored: AtomicU64,
    entries_invalidated: AtomicU64,
    subscriptions: AtomicU64,
    stream_errors: AtomicU64,
}

impl AtomicInvalidationStats {
    fn snapshot(&self) -> InvalidationStats {
        InvalidationStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            entries_invalidated: self.entries_invalidated.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }
}

enum StreamEnd {
    Shutdown,
    Closed,
    Failed(QueryError),
}

/// Background subscriber turning row changes into tag invalidations
pub struct ChangeSubscriber {
    remote: Arc<dyn RemoteLink>,
    cache: Arc<CacheCoordinator>,
    config: InvalidationConfig,
    stats: Arc<AtomicInvalidationStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChangeSubscriber {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteLink>, cache: Arc<CacheCoordinator>, config: InvalidationConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            remote,
            cache,
            config,
            stats: Arc::new(AtomicInvalidationStats::default()),
            shutdown_tx,
        }
    }

    #[must_use]
    pub fn stats(&self) -> InvalidationStats {
        self.stats.snapshot()
    }

    fn filter(&self) -> ChangeFilter {
        ChangeFilter::tables(self.config.tables.iter().cloned())
    }

    /// Spawn the subscription loop
    pub fn start(&self) -> JoinHandle<()> {
        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        let config = self.config.clone();
        let stats = Arc::clone(&self.stats);
        let filter = self.filter();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let end = Self::run_stream(&*remote, &cache, &config, &filter, &stats, &mut shutdown_rx).await;
                match end {
                    StreamEnd::Shutdown => {
                        info!("Change subscriber shutting down");
                        break;
                    }
                    StreamEnd::Closed => {
                        warn!(
                            delay_ms = crate::clock::duration_millis(config.resubscribe_delay),
                            "Change stream closed; resubscribing"
                        );
                    }
                    StreamEnd::Failed(e) => {
                        stats.stream_errors.fetch_add(1, Ordering::Relaxed);
                        error!(
                            error = %e,
                            delay_ms = crate::clock::duration_millis(config.resubscribe_delay),
                            "Change stream failed; resubscribing"
                        );
                    }
                }

                tokio::select! {
                    () = tokio::time::sleep(config.resubscribe_delay) => {},
                    _ = shutdown_rx.recv() => {
                        info!("Change subscriber shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn run_stream(
        remote: &dyn RemoteLink,
        cache: &CacheCoordinator,
        config: &InvalidationConfig,
        filter: &ChangeFilter,
        stats: &AtomicInvalidationStats,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> StreamEnd {
        let mut stream = tokio::select! {
            subscribed = remote.subscribe_changes(filter) => match subscribed {
                Ok(stream) => stream,
                Err(e) => return StreamEnd::Failed(e),
            },
            _ = shutdown_rx.recv() => return StreamEnd::Shutdown,
        };
        stats.subscriptions.fetch_add(1, Ordering::Relaxed);
        info!(tables = ?filter.tables, remote = remote.name(), "Subscribed to change stream");

        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(event)) => Self::handle_event(cache, config, filter, stats, &event).await,
                    Some(Err(e)) => return StreamEnd::Failed(e),
                    None => return StreamEnd::Closed,
                },
                _ = shutdown_rx.recv() => return StreamEnd::Shutdown,
            }
        }
    }

    async fn handle_event(
        cache: &CacheCoordinator,
        config: &InvalidationConfig,
        filter: &ChangeFilter,
        stats: &AtomicInvalidationStats,
        event: &ChangeEvent,
    ) {
        stats.events_received.fetch_add(1, Ordering::Relaxed);
        if !filter.matches(&event.table) {
            stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let tags = config.tags_for(&event.table);
        let removed = cache.invalidate_by_tags(&tags).await;
        stats
            .entries_invalidated
            .fetch_add(u64::try_from(removed).unwrap_or(u64::MAX), Ordering::Relaxed);
        debug!(table = %event.table, kind = %event.kind, tags = ?tags, removed, "Invalidated on change");
    }

    /// Stop the loop started by [`start`](Self::start)
    pub fn shutdown(&self) {
        // No receivers means the loop was never started
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryKeyValueStore, MemoryTier, PersistentTier, RelationalTier};
    use crate::cache_coordinator::{CacheOptions, Tiers};
    use crate::clock::ManualClock;
    use crate::config::{CoordinatorConfig, MemoryTierConfig, PersistentTierConfig, RelationalTierConfig};
    use crate::remote::{ChangeStream, Mutation, MutationKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::collections::{BTreeMap, VecDeque};
    use std::time::Duration;
    use tokio::sync::mpsc;

    type EventSender = mpsc::UnboundedSender<Result<ChangeEvent, QueryError>>;

    /// Hands out one pre-built stream per subscribe call
    struct StreamingRemote {
        streams: Mutex<VecDeque<Result<ChangeStream, QueryError>>>,
    }

    impl StreamingRemote {
        fn new() -> Self {
            Self {
                streams: Mutex::new(VecDeque::new()),
            }
        }

        fn push_stream(&self) -> EventSender {
            let (tx, rx) = mpsc::unbounded_channel();
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            });
            self.streams.lock().push_back(Ok(Box::pin(stream)));
            tx
        }

        fn push_failure(&self) {
            self.streams
                .lock()
                .push_back(Err(QueryError::network("socket closed")));
        }
    }

    #[async_trait]
    impl RemoteLink for StreamingRemote {
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
            match self.streams.lock().pop_front() {
                Some(next) => next,
                None => Ok(Box::pin(futures_util::stream::pending())),
            }
        }
    }

    fn cache() -> Arc<CacheCoordinator> {
        let clock = Arc::new(ManualClock::new(0));
        let tiers = Tiers {
            memory: Arc::new(MemoryTier::new(MemoryTierConfig::default(), clock.clone())),
            persistent: Arc::new(PersistentTier::new(
                Arc::new(MemoryKeyValueStore::new()),
                PersistentTierConfig::default(),
                clock.clone(),
            )),
            relational: Arc::new(
                RelationalTier::open(RelationalTierConfig::default(), clock.clone()).unwrap(),
            ),
        };
        Arc::new(
            CacheCoordinator::new(
                tiers,
                MemoryTierConfig::default().max_bytes,
                CoordinatorConfig::default(),
                clock,
            )
            .unwrap(),
        )
    }

    fn event(table: &str) -> ChangeEvent {
        ChangeEvent {
            table: table.to_string(),
            kind: MutationKind::Update,
            record: Some(json!({"id": "1"})),
            old_record: None,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_invalidates_mapped_tags() {
        let cache = cache();
        let remote = Arc::new(StreamingRemote::new());
        let tx = remote.push_stream();

        cache
            .set_with("lesson:1", &json!("a"), &CacheOptions::new().with_tags(["lessons"]))
            .await;
        cache
            .set_with("progress:1", &json!("b"), &CacheOptions::new().with_tags(["progress"]))
            .await;

        let mut table_tags = BTreeMap::new();
        table_tags.insert("lesson_rows".to_string(), vec!["lessons".to_string()]);
        let config = InvalidationConfig {
            table_tags,
            ..InvalidationConfig::default()
        };
        let subscriber = ChangeSubscriber::new(remote.clone(), cache.clone(), config);
        let handle = subscriber.start();
        settle().await;

        tx.send(Ok(event("lesson_rows"))).unwrap();
        settle().await;

        assert_eq!(cache.get::<Value>("lesson:1").await, None);
        assert_eq!(cache.get::<Value>("progress:1").await, Some(json!("b")));
        let stats = subscriber.stats();
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.entries_invalidated, 1);

        subscriber.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatched_tables_are_ignored() {
        let cache = cache();
        let remote = Arc::new(StreamingRemote::new());
        let tx = remote.push_stream();
        cache
            .set_with("notes:1", &json!(1), &CacheOptions::new().with_tags(["notes"]))
            .await;

        let config = InvalidationConfig {
            tables: vec!["lessons".to_string()],
            ..InvalidationConfig::default()
        };
        let subscriber = ChangeSubscriber::new(remote, cache.clone(), config);
        let handle = subscriber.start();
        settle().await;

        tx.send(Ok(event("notes"))).unwrap();
        settle().await;

        assert_eq!(cache.get::<Value>("notes:1").await, Some(json!(1)));
        assert_eq!(subscriber.stats().events_ignored, 1);

        subscriber.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_failure() {
        let cache = cache();
        let remote = Arc::new(StreamingRemote::new());
        remote.push_failure();
        let tx = remote.push_stream();
        cache
            .set_with("notes:1", &json!(1), &CacheOptions::new().with_tags(["notes"]))
            .await;

        let subscriber = ChangeSubscriber::new(remote, cache.clone(), InvalidationConfig::default());
        let handle = subscriber.start();
        settle().await;
        assert_eq!(subscriber.stats().stream_errors, 1);
        assert_eq!(subscriber.stats().subscriptions, 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(subscriber.stats().subscriptions, 1);

        tx.send(Ok(event("notes"))).unwrap();
        settle().await;
        assert_eq!(cache.get::<Value>("notes:1").await, None);

        subscriber.shutdown();
        handle.await.unwrap();
    }
}

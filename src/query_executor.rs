//! Query Executor
//!
//! Runs remote operations behind the cache:
//!
//! 1. Unless `force_refresh` is set, a cache hit returns immediately with no
//!    network call.
//! 2. On a miss the operation runs under a deadline taken from the current
//!    [`NetworkProfile`](crate::network::NetworkProfile).
//! 3. Retryable failures back off and retry; `AuthExpired` refreshes the
//!    session and retries once; everything else is returned at once.
//! 4. A non-null result is written back to the cache.
//!
//! Callers always get a [`QueryResult`]; nothing here returns `Err`.

use futures_util::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache_coordinator::{CacheCoordinator, CacheOptions};
use crate::clock::{Clock, duration_millis};
use crate::config::ExecutorConfig;
use crate::conflict::ResolutionStrategy;
use crate::entry::CachePriority;
use crate::error::{ErrorKind, QueryError};
use crate::metrics::{QueryMetric, QueryMetrics, QueryStats};
use crate::network::{ConnectionQuality, NetworkMonitor};
use crate::offline_queue::{EnqueueOptions, OfflineQueue, OperationMetadata, OperationPriority};
use crate::remote::{AuthRefresher, Mutation, RemoteLink};
use crate::retry::RetryPolicy;

/// `{data, error}` pair returned by every executor call
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub data: Option<T>,
    pub from_cache: bool,
    pub error: Option<QueryError>,
    /// Id of the offline-queue operation the write was handed to
    pub queued_operation: Option<String>,
}

impl<T> QueryResult<T> {
    fn ok(data: T, from_cache: bool) -> Self {
        Self {
            data: Some(data),
            from_cache,
            error: None,
            queued_operation: None,
        }
    }

    fn failed(error: QueryError) -> Self {
        Self {
            data: None,
            from_cache: false,
            error: Some(error),
            queued_operation: None,
        }
    }

    fn queued(operation_id: String) -> Self {
        Self {
            data: None,
            from_cache: false,
            error: None,
            queued_operation: Some(operation_id),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-call options for [`QueryExecutor::execute`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub cache: CacheOptions,
    /// Skip the cache lookup and always go remote
    pub force_refresh: bool,
    /// Overrides the deadline from the network profile
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cache_options(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }
}

/// One entry of [`QueryExecutor::execute_batch`]
pub struct BatchQuery<F> {
    pub key: String,
    pub op: F,
    pub options: QueryOptions,
}

impl<F> BatchQuery<F> {
    pub fn new(key: impl Into<String>, op: F) -> Self {
        Self {
            key: key.into(),
            op,
            options: QueryOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

/// Options for [`QueryExecutor::execute_mutation`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOptions {
    /// Replay priority if the write ends up in the offline queue
    pub priority: OperationPriority,
    pub max_retries: Option<u32>,
    /// Cache tags invalidated once the write lands
    pub invalidate_tags: Vec<String>,
    /// Server row the edit was based on
    pub snapshot: Option<Value>,
    pub strategy: ResolutionStrategy,
}

impl MutationOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_priority(mut self, priority: OperationPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_invalidate_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidate_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_snapshot(mut self, snapshot: Value, strategy: ResolutionStrategy) -> Self {
        self.snapshot = Some(snapshot);
        self.strategy = strategy;
        self
    }

    fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            priority: self.priority,
            max_retries: self.max_retries,
            metadata: OperationMetadata {
                local_snapshot: self.snapshot.clone(),
                strategy: self.strategy,
                invalidate_tags: self.invalidate_tags.clone(),
            },
        }
    }
}

/// Network-aware query execution over the cache
pub struct QueryExecutor {
    cache: Arc<CacheCoordinator>,
    monitor: Arc<NetworkMonitor>,
    queue: Arc<OfflineQueue>,
    remote: Arc<dyn RemoteLink>,
    auth: Option<Arc<dyn AuthRefresher>>,
    retry: RetryPolicy,
    metrics: QueryMetrics,
    clock: Arc<dyn Clock>,
}

impl QueryExecutor {
    #[must_use]
    pub fn new(
        cache: Arc<CacheCoordinator>,
        monitor: Arc<NetworkMonitor>,
        queue: Arc<OfflineQueue>,
        remote: Arc<dyn RemoteLink>,
        config: &ExecutorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            monitor,
            queue,
            remote,
            auth: None,
            retry: RetryPolicy::from(config),
            metrics: QueryMetrics::new(config.metrics_capacity, config.slow_query_threshold),
            clock,
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn AuthRefresher>) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Read `key` from the cache, or run `op` and cache its result.
    ///
    /// Concurrent misses for the same key share one remote call. While the
    /// network is unreachable a miss returns a `NetworkUnavailable` error
    /// without calling `op`.
    pub async fn execute<T, F, Fut>(&self, key: &str, op: F, opts: &QueryOptions) -> QueryResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, QueryError>> + Send,
    {
        let started = Instant::now();
        let quality = self.monitor.quality();
        let timeout = opts.timeout.unwrap_or_else(|| self.monitor.profile().timeout);
        let attempts = AtomicU32::new(0);

        let outcome = if opts.force_refresh {
            match self.fetch_remote(&op, timeout, &attempts).await {
                Ok(value) => {
                    if serde_json::to_value(&value).is_ok_and(|v| !v.is_null()) {
                        self.cache.set_with(key, &value, &opts.cache).await;
                    }
                    Ok((value, false))
                }
                Err(e) => Err(e),
            }
        } else {
            self.cache
                .get_or_fetch_tracked(key, &opts.cache, || {
                    self.fetch_remote(&op, timeout, &attempts)
                })
                .await
        };

        let attempts = attempts.load(Ordering::Relaxed);
        let result = match outcome {
            Ok((value, from_cache)) => QueryResult::ok(value, from_cache),
            Err(error) => {
                if error.kind == ErrorKind::NetworkUnavailable {
                    debug!(key = %key, "Network unavailable; read is a miss");
                } else {
                    warn!(key = %key, attempts, error = %error, "Query failed");
                }
                QueryResult::failed(error)
            }
        };

        self.record(key, started, &result, attempts, quality);
        result
    }

    /// Run a mutation, or hand it to the offline queue when the backend is unreachable.
    pub async fn execute_mutation(&self, mutation: Mutation, opts: MutationOptions) -> QueryResult<Value> {
        let started = Instant::now();
        let quality = self.monitor.quality();
        let key = format!("mutation:{}:{}", mutation.table(), mutation.kind());

        if !self.monitor.is_online() {
            let id = self.queue.enqueue(mutation, opts.enqueue_options()).await;
            info!(operation_id = %id, "Offline; mutation queued");
            let result = QueryResult::queued(id);
            self.record(&key, started, &result, 0, quality);
            return result;
        }

        let timeout = self.monitor.profile().timeout;
        let attempts = AtomicU32::new(0);
        let outcome = self
            .run_with_retry(&|| self.remote.apply(&mutation), timeout, &attempts)
            .await;
        let attempts = attempts.load(Ordering::Relaxed);

        let result = match outcome {
            Ok(data) => {
                if !opts.invalidate_tags.is_empty() {
                    self.cache.invalidate_by_tags(&opts.invalidate_tags).await;
                }
                QueryResult::ok(data, false)
            }
            Err(error) if error.kind == ErrorKind::NetworkUnavailable => {
                let id = self.queue.enqueue(mutation, opts.enqueue_options()).await;
                info!(operation_id = %id, "Backend unreachable; mutation queued");
                QueryResult::queued(id)
            }
            Err(error) if error.kind == ErrorKind::DataConflict => {
                let id = self
                    .queue
                    .park_conflict(mutation, opts.enqueue_options(), &error)
                    .await;
                warn!(operation_id = %id, error = %error, "Mutation conflicted; parked for resolution");
                QueryResult {
                    queued_operation: Some(id),
                    ..QueryResult::failed(error)
                }
            }
            Err(error) => {
                warn!(table = mutation.table(), attempts, error = %error, "Mutation failed");
                QueryResult::failed(error)
            }
        };

        self.record(&key, started, &result, attempts, quality);
        result
    }

    /// Run many queries in connectivity-sized batches.
    ///
    /// Queries inside a batch run concurrently, batches run in sequence with
    /// the profile's inter-batch delay. One failure never aborts the rest;
    /// results come back in input order.
    pub async fn execute_batch<T, F, Fut>(&self, queries: Vec<BatchQuery<F>>) -> Vec<QueryResult<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, QueryError>> + Send,
    {
        let profile = self.monitor.profile();
        let size = profile.batch_size.max(1);
        debug!(
            queries = queries.len(),
            batch_size = size,
            delay_ms = duration_millis(profile.batch_delay),
            "Executing batch"
        );

        let mut results = Vec::with_capacity(queries.len());
        for (index, chunk) in queries.chunks(size).enumerate() {
            if index > 0 && !profile.batch_delay.is_zero() {
                tokio::time::sleep(profile.batch_delay).await;
            }
            let batch = join_all(
                chunk
                    .iter()
                    .map(|query| self.execute(&query.key, &query.op, &query.options)),
            )
            .await;
            results.extend(batch);
        }
        results
    }

    /// Fire-and-forget [`execute`](Self::execute) to warm the cache.
    ///
    /// Returns `None` when the current network profile does not admit a
    /// prefetch at `priority`. Failures are logged, never surfaced.
    pub fn prefetch<T, F, Fut>(
        self: &Arc<Self>,
        key: impl Into<String>,
        op: F,
        priority: CachePriority,
    ) -> Option<JoinHandle<()>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let key = key.into();
        let quality = self.monitor.quality();
        if !self.monitor.is_online() || !self.monitor.profile().allows_prefetch(priority) {
            debug!(key = %key, quality = ?quality, priority = %priority, "Prefetch skipped");
            return None;
        }

        let executor = Arc::clone(self);
        Some(tokio::spawn(async move {
            let opts = QueryOptions::new().with_cache_options(CacheOptions::new().with_priority(priority));
            let result: QueryResult<T> = executor.execute(&key, op, &opts).await;
            match result.error {
                Some(error) => debug!(key = %key, error = %error, "Prefetch failed"),
                None => debug!(key = %key, from_cache = result.from_cache, "Prefetch done"),
            }
        }))
    }

    #[must_use]
    pub fn get_metrics(&self) -> QueryStats {
        self.metrics.stats()
    }

    #[must_use]
    pub fn recent_metrics(&self) -> Vec<QueryMetric> {
        self.metrics.recent()
    }

    async fn fetch_remote<T, F, Fut>(&self, op: &F, timeout: Duration, attempts: &AtomicU32) -> Result<T, QueryError>
    where
        F: Fn() -> Fut + Sync,
        Fut: Future<Output = Result<T, QueryError>> + Send,
    {
        if !self.monitor.is_online() {
            return Err(QueryError::network("network unreachable"));
        }
        self.run_with_retry(op, timeout, attempts).await
    }

    async fn run_with_retry<T, F, Fut>(&self, op: &F, timeout: Duration, attempts: &AtomicU32) -> Result<T, QueryError>
    where
        F: Fn() -> Fut + Sync,
        Fut: Future<Output = Result<T, QueryError>> + Send,
    {
        let mut retries = 0;
        let mut refreshed = false;

        loop {
            attempts.fetch_add(1, Ordering::Relaxed);
            let error = match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => error,
                Err(_) => QueryError::timeout(timeout),
            };

            match error.kind {
                ErrorKind::AuthExpired if !refreshed => {
                    let Some(auth) = &self.auth else {
                        return Err(error);
                    };
                    refreshed = true;
                    if let Err(e) = auth.refresh_session().await {
                        warn!(error = %e, "Session refresh failed");
                        return Err(error);
                    }
                    info!("Session refreshed; retrying once");
                }
                kind if kind.is_retryable() && retries < self.retry.max_retries => {
                    retries += 1;
                    let delay = self.retry.delay_for(retries);
                    warn!(
                        retry = retries,
                        max_retries = self.retry.max_retries,
                        delay_ms = duration_millis(delay),
                        error = %error,
                        "Retrying remote operation"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(error),
            }
        }
    }

    fn record<T>(
        &self,
        key: &str,
        started: Instant,
        result: &QueryResult<T>,
        attempts: u32,
        quality: ConnectionQuality,
    ) {
        self.metrics.record(QueryMetric {
            key: key.to_string(),
            duration: started.elapsed(),
            from_cache: result.from_cache,
            attempts,
            error: result.error.as_ref().map(|e| e.kind),
            quality,
            recorded_at: self.clock.now_millis(),
        });
    }
}

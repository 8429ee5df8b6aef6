//! Offline Queue
//!
//! Durable priority queue of writes that could not go to the backend
//! directly. Operations are replayed when connectivity returns:
//!
//! ```text
//! queued -> replaying -> completed
//!                     -> queued (retry_count + 1, backoff)
//!                     -> permanently failed (retries exhausted or permanent error)
//!                     -> conflict (resolved automatically or parked for manual review)
//! ```
//!
//! Replay order is priority (high first), then age (oldest first). All
//! queue state is written to the [`KeyValueStore`] after every change and
//! reloaded by [`OfflineQueue::init`].

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache_coordinator::{CacheCoordinator, FlagGuard};
use crate::clock::{Clock, duration_millis};
use crate::codecs::JsonCodec;
use crate::config::QueueConfig;
use crate::conflict::{
    ConflictKind, ConflictRecord, ConflictResolution, ResolutionStrategy, detect_conflict,
    merge_records, system_fields_with,
};
use crate::error::{CoreError, ErrorKind, QueryError};
use crate::network::NetworkMonitor;
use crate::remote::{Mutation, MutationKind, RemoteLink};
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::traits::{CacheCodec, KeyValueStore};

/// Name of the retention task registered with the [`Scheduler`]
pub const RETENTION_TASK: &str = "offline_queue_cleanup";

const PENDING_RECORD: &str = "pending";
const CONFLICTS_RECORD: &str = "conflicts";
const HISTORY_RECORD: &str = "conflict_history";
const FAILED_RECORD: &str = "failed";

/// Replay priority band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Optional replay context attached to an operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
    /// Server row the local edit was based on, for conflict detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_snapshot: Option<Value>,
    #[serde(default)]
    pub strategy: ResolutionStrategy,
    /// Cache tags to invalidate once the write lands
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalidate_tags: Vec<String>,
}

/// A write waiting for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub mutation: Mutation,
    pub enqueued_at: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: OperationPriority,
    #[serde(default)]
    pub metadata: OperationMetadata,
    /// Backoff gate; the operation is not replayed before this instant
    #[serde(default)]
    pub next_attempt_at: Option<u64>,
    #[serde(default)]
    pub last_error: Option<QueryError>,
}

impl QueuedOperation {
    #[must_use]
    pub fn table(&self) -> &str {
        self.mutation.table()
    }

    #[must_use]
    pub fn kind(&self) -> MutationKind {
        self.mutation.kind()
    }

    fn is_due(&self, now: u64) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Options for [`OfflineQueue::enqueue`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub priority: OperationPriority,
    /// Falls back to the queue's default
    pub max_retries: Option<u32>,
    pub metadata: OperationMetadata,
}

impl EnqueueOptions {
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
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn with_snapshot(mut self, snapshot: Value) -> Self {
        self.metadata.local_snapshot = Some(snapshot);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.metadata.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_invalidate_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata
            .invalidate_tags
            .extend(tags.into_iter().map(Into::into));
        self
    }
}

/// A high-priority write that will not be retried, kept for manual review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermanentFailure {
    pub operation: QueuedOperation,
    pub error: QueryError,
    pub failed_at: u64,
}

/// Pending operations per priority band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Snapshot of the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub total_operations: usize,
    pub by_priority: PriorityCounts,
    /// Age of the oldest pending operation
    pub oldest_age_ms: Option<u64>,
    pub conflict_count: usize,
    pub failed_count: usize,
    pub is_processing: bool,
}

/// Outcome of one replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// The pass did not run: another was in progress or the network is unreachable
    pub skipped: bool,
    pub attempted: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Conflicts detected, whether resolved automatically or parked
    pub conflicts: usize,
    /// Pending operations still inside their backoff window
    pub deferred: usize,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<QueuedOperation>,
    conflicts: Vec<ConflictRecord>,
    history: VecDeque<ConflictRecord>,
    failed: Vec<PermanentFailure>,
}

impl QueueState {
    fn position(&self, id: &str) -> Option<usize> {
        self.pending.iter().position(|op| op.id == id)
    }

    fn take(&mut self, id: &str) -> Option<QueuedOperation> {
        self.position(id).map(|pos| self.pending.remove(pos))
    }
}

enum Outcome {
    Completed,
    AutoResolved(ConflictRecord),
    Deferred(ConflictRecord),
    Retry(QueryError),
    Permanent(QueryError),
    /// Network dropped mid-pass; the operation keeps its retry budget
    Offline,
}

/// Offline write queue
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    codec: JsonCodec,
    remote: Arc<dyn RemoteLink>,
    monitor: Arc<NetworkMonitor>,
    cache: Option<Arc<CacheCoordinator>>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    backoff: RetryPolicy,
    system_fields: Vec<String>,
    state: Mutex<QueueState>,
    processing: AtomicBool,
    /// Serializes state snapshots so the newest one is written last
    persist_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteLink>,
        monitor: Arc<NetworkMonitor>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            store = store.name(),
            remote = remote.name(),
            max_queue_size = config.max_queue_size,
            batch_size = config.batch_size,
            "Initializing offline queue"
        );

        Self {
            store,
            codec: JsonCodec,
            remote,
            monitor,
            cache: None,
            system_fields: system_fields_with(&config.extra_system_fields),
            config,
            clock,
            backoff: RetryPolicy::default(),
            state: Mutex::new(QueueState::default()),
            processing: AtomicBool::new(false),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Invalidate cache tags through `cache` after replayed writes land
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheCoordinator>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn storage_key(&self, record: &str) -> String {
        format!("{}{}", self.config.storage_prefix, record)
    }

    /// Reload persisted queue state, replacing what is in memory.
    ///
    /// Undecodable records are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Storage`] if the key-value store cannot be read.
    pub async fn init(&self) -> Result<usize, CoreError> {
        let pending: Vec<QueuedOperation> = self.load_record(PENDING_RECORD).await?;
        let conflicts: Vec<ConflictRecord> = self.load_record(CONFLICTS_RECORD).await?;
        let history: VecDeque<ConflictRecord> = self.load_record(HISTORY_RECORD).await?;
        let failed: Vec<PermanentFailure> = self.load_record(FAILED_RECORD).await?;

        let count = pending.len();
        info!(
            pending = count,
            conflicts = conflicts.len(),
            failed = failed.len(),
            "[Queue] Restored queue state"
        );
        *self.state.lock() = QueueState {
            pending,
            conflicts,
            history,
            failed,
        };
        Ok(count)
    }

    async fn load_record<T: DeserializeOwned + Default>(&self, record: &str) -> Result<T, CoreError> {
        let Some(raw) = self.store.get_item(&self.storage_key(record)).await? else {
            return Ok(T::default());
        };
        match self.codec.decode(&raw) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(record, error = %e, "[Queue] Dropping undecodable queue record");
                Ok(T::default())
            }
        }
    }

    async fn persist(&self) {
        let _serial = self.persist_lock.lock().await;
        let records = {
            let state = self.state.lock();
            [
                (PENDING_RECORD, self.codec.encode(&state.pending)),
                (CONFLICTS_RECORD, self.codec.encode(&state.conflicts)),
                (HISTORY_RECORD, self.codec.encode(&state.history)),
                (FAILED_RECORD, self.codec.encode(&state.failed)),
            ]
        };

        for (record, encoded) in records {
            let result = match encoded {
                Ok(raw) => self.store.set_item(&self.storage_key(record), &raw).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(record, error = %e, "[Queue] Failed to persist queue state");
            }
        }
    }

    /// Add a write to the queue, returning its operation id.
    ///
    /// When the queue is full the oldest low-priority operation is evicted,
    /// then medium, then high.
    pub async fn enqueue(&self, mutation: Mutation, opts: EnqueueOptions) -> String {
        let op = QueuedOperation {
            id: Uuid::new_v4().to_string(),
            mutation,
            enqueued_at: self.clock.now_millis(),
            retry_count: 0,
            max_retries: opts.max_retries.unwrap_or(self.config.default_max_retries),
            priority: opts.priority,
            metadata: opts.metadata,
            next_attempt_at: None,
            last_error: None,
        };
        let id = op.id.clone();

        info!(
            operation_id = %id,
            table = op.table(),
            action = %op.kind(),
            priority = ?op.priority,
            "[Queue] Operation enqueued"
        );
        let evicted = {
            let mut state = self.state.lock();
            let evicted = make_room(&mut state.pending, self.config.max_queue_size);
            state.pending.push(op);
            evicted
        };
        for op in &evicted {
            warn!(
                operation_id = %op.id,
                table = op.table(),
                priority = ?op.priority,
                "[Queue] Queue full; evicted operation"
            );
        }

        self.persist().await;
        id
    }

    /// Park a write the backend rejected as conflicting, for manual resolution.
    ///
    /// Returns the operation id under which the conflict is recorded.
    pub async fn park_conflict(&self, mutation: Mutation, opts: EnqueueOptions, error: &QueryError) -> String {
        let op = QueuedOperation {
            id: Uuid::new_v4().to_string(),
            mutation,
            enqueued_at: self.clock.now_millis(),
            retry_count: 0,
            max_retries: opts.max_retries.unwrap_or(self.config.default_max_retries),
            priority: opts.priority,
            metadata: opts.metadata,
            next_attempt_at: None,
            last_error: Some(error.clone()),
        };
        let id = op.id.clone();
        if let Outcome::Deferred(record) = self.error_outcome(&op, error.clone()) {
            self.state.lock().conflicts.push(record);
            self.persist().await;
        }
        id
    }

    /// Replay pending operations against the backend.
    ///
    /// Single-flight: a call made while a pass is running returns a skipped
    /// report, as does a call while the network is unreachable. Operations run
    /// concurrently within a batch and batches run in sequence. A network
    /// failure ends the pass without consuming the operation's retries.
    pub async fn process_queue(&self) -> ReplayReport {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[Queue] Replay already running; skipping");
            return ReplayReport {
                skipped: true,
                ..ReplayReport::default()
            };
        }
        let _flag = FlagGuard(&self.processing);

        if !self.monitor.is_online() {
            debug!("[Queue] Network unreachable; replay skipped");
            return ReplayReport {
                skipped: true,
                ..ReplayReport::default()
            };
        }

        let now = self.clock.now_millis();
        let mut report = ReplayReport::default();
        let order: Vec<String> = {
            let state = self.state.lock();
            let mut due: Vec<&QueuedOperation> =
                state.pending.iter().filter(|op| op.is_due(now)).collect();
            report.deferred = state.pending.len() - due.len();
            due.sort_by_key(|op| (Reverse(op.priority), op.enqueued_at));
            due.into_iter().map(|op| op.id.clone()).collect()
        };
        if order.is_empty() {
            return report;
        }

        info!(operations = order.len(), deferred = report.deferred, "[Queue] Replay started");
        for batch in order.chunks(self.config.batch_size.max(1)) {
            let ops: Vec<QueuedOperation> = {
                let state = self.state.lock();
                batch
                    .iter()
                    .filter_map(|id| state.pending.iter().find(|op| op.id == *id).cloned())
                    .collect()
            };
            let outcomes = join_all(ops.iter().map(|op| self.replay_one(op))).await;
            report.attempted += ops.len();

            let (stop, invalidations) = self.settle(&ops, outcomes, &mut report);
            self.persist().await;
            self.invalidate(invalidations).await;

            if stop {
                info!("[Queue] Network lost during replay; pass stopped");
                break;
            }
        }

        info!(
            attempted = report.attempted,
            completed = report.completed,
            requeued = report.requeued,
            failed = report.failed,
            conflicts = report.conflicts,
            "[Queue] Replay finished"
        );
        report
    }

    async fn replay_one(&self, op: &QueuedOperation) -> Outcome {
        if let (Mutation::Update { table, id, data }, Some(snapshot)) =
            (&op.mutation, &op.metadata.local_snapshot)
        {
            match self.remote.fetch_record(table, id).await {
                Ok(Some(remote)) => {
                    if let Some(kind) = detect_conflict(snapshot, &remote) {
                        return self.settle_conflict(op, kind, data, remote).await;
                    }
                }
                Ok(None) => {}
                Err(e) => return self.error_outcome(op, e),
            }
        }

        match self.remote.apply(&op.mutation).await {
            Ok(_) => {
                debug!(operation_id = %op.id, table = op.table(), "[Queue] Operation replayed");
                Outcome::Completed
            }
            Err(e) => self.error_outcome(op, e),
        }
    }

    async fn settle_conflict(
        &self,
        op: &QueuedOperation,
        kind: ConflictKind,
        local: &Value,
        remote: Value,
    ) -> Outcome {
        let strategy = op.metadata.strategy;
        warn!(
            operation_id = %op.id,
            table = op.table(),
            kind = ?kind,
            strategy = ?strategy,
            "[Queue] Conflict detected"
        );

        let mut record = self.conflict_record(op, kind, local.clone(), Some(remote.clone()), strategy);
        let write = match strategy {
            ResolutionStrategy::Manual => {
                record.operation = Some(Box::new(op.clone()));
                return Outcome::Deferred(record);
            }
            ResolutionStrategy::ServerWins => None,
            ResolutionStrategy::ClientWins => Some(op.mutation.clone()),
            ResolutionStrategy::Merge => {
                let merged = merge_records(local, &remote, &self.system_fields);
                record.merged_data = Some(merged.clone());
                Some(op.mutation.clone().with_data(merged))
            }
        };

        if let Some(mutation) = write {
            if let Err(e) = self.remote.apply(&mutation).await {
                return self.error_outcome(op, e);
            }
        }
        record.resolved_at = Some(self.clock.now_millis());
        Outcome::AutoResolved(record)
    }

    fn error_outcome(&self, op: &QueuedOperation, error: QueryError) -> Outcome {
        match error.kind {
            ErrorKind::NetworkUnavailable => Outcome::Offline,
            ErrorKind::DataConflict => {
                let kind = if error.code.as_deref().is_some_and(|c| c.starts_with("23")) {
                    ConflictKind::ConstraintViolation
                } else {
                    ConflictKind::DataConflict
                };
                warn!(operation_id = %op.id, error = %error, "[Queue] Backend reported a conflict");
                let local = op.mutation.data().cloned().unwrap_or(Value::Null);
                let mut record =
                    self.conflict_record(op, kind, local, None, ResolutionStrategy::Manual);
                record.operation = Some(Box::new(op.clone()));
                Outcome::Deferred(record)
            }
            kind if kind.is_permanent() => Outcome::Permanent(error),
            _ => Outcome::Retry(error),
        }
    }

    fn conflict_record(
        &self,
        op: &QueuedOperation,
        kind: ConflictKind,
        local_data: Value,
        remote_data: Option<Value>,
        strategy: ResolutionStrategy,
    ) -> ConflictRecord {
        ConflictRecord {
            operation_id: op.id.clone(),
            kind,
            table: op.table().to_string(),
            record_id: op.mutation.record_id(),
            local_data,
            remote_data,
            strategy,
            merged_data: None,
            detected_at: self.clock.now_millis(),
            resolved_at: None,
            operation: None,
        }
    }

    /// Apply a batch's outcomes to the queue state.
    ///
    /// Returns whether the pass must stop and the tag sets to invalidate.
    fn settle(
        &self,
        ops: &[QueuedOperation],
        outcomes: Vec<Outcome>,
        report: &mut ReplayReport,
    ) -> (bool, Vec<Vec<String>>) {
        let now = self.clock.now_millis();
        let mut stop = false;
        let mut invalidations = Vec::new();
        let mut state = self.state.lock();

        for (op, outcome) in ops.iter().zip(outcomes) {
            match outcome {
                Outcome::Completed => {
                    state.take(&op.id);
                    report.completed += 1;
                    invalidations.push(op.metadata.invalidate_tags.clone());
                }
                Outcome::AutoResolved(record) => {
                    state.take(&op.id);
                    report.completed += 1;
                    report.conflicts += 1;
                    invalidations.push(op.metadata.invalidate_tags.clone());
                    push_bounded(&mut state.history, record, self.config.conflict_history);
                }
                Outcome::Deferred(record) => {
                    state.take(&op.id);
                    report.conflicts += 1;
                    state.conflicts.push(record);
                }
                Outcome::Retry(error) => {
                    let Some(pos) = state.position(&op.id) else {
                        continue;
                    };
                    let Some(queued) = state.pending.get_mut(pos) else {
                        continue;
                    };
                    queued.retry_count += 1;
                    queued.last_error = Some(error.clone());
                    if queued.retry_count > queued.max_retries {
                        let op = state.pending.remove(pos);
                        report.failed += 1;
                        record_failure(&mut state, op, error, now);
                    } else {
                        let delay = self.backoff.delay_for(queued.retry_count);
                        queued.next_attempt_at = Some(now.saturating_add(duration_millis(delay)));
                        report.requeued += 1;
                        warn!(
                            operation_id = %queued.id,
                            retry = queued.retry_count,
                            max_retries = queued.max_retries,
                            delay_ms = duration_millis(delay),
                            error = %error,
                            "[Queue] Replay failed; requeued"
                        );
                    }
                }
                Outcome::Permanent(error) => {
                    if let Some(op) = state.take(&op.id) {
                        report.failed += 1;
                        record_failure(&mut state, op, error, now);
                    }
                }
                Outcome::Offline => stop = true,
            }
        }

        (stop, invalidations)
    }

    async fn invalidate(&self, tag_sets: Vec<Vec<String>>) {
        let Some(cache) = &self.cache else {
            return;
        };
        for tags in tag_sets.into_iter().filter(|tags| !tags.is_empty()) {
            cache.invalidate_by_tags(&tags).await;
        }
    }

    /// Conflicts parked for manual resolution
    #[must_use]
    pub fn get_conflicts(&self) -> Vec<ConflictRecord> {
        self.state.lock().conflicts.clone()
    }

    /// Recently resolved conflicts, oldest first
    #[must_use]
    pub fn get_conflict_history(&self) -> Vec<ConflictRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Settle a parked conflict.
    ///
    /// `UseLocal` and `Merge` re-enqueue the write (without a snapshot, so it
    /// is not checked again); `UseRemote` drops it. Returns `false` when no
    /// parked conflict has that operation id.
    pub async fn resolve_conflict(&self, operation_id: &str, resolution: ConflictResolution) -> bool {
        let Some(record) = ({
            let mut state = self.state.lock();
            let pos = state.conflicts.iter().position(|c| c.operation_id == operation_id);
            pos.map(|pos| state.conflicts.remove(pos))
        }) else {
            warn!(operation_id, "[Queue] No pending conflict to resolve");
            return false;
        };

        let mut resolved = record.clone();
        resolved.operation = None;
        resolved.resolved_at = Some(self.clock.now_millis());

        let requeue = match (&resolution, record.operation) {
            (ConflictResolution::UseRemote, op) => {
                if let Some(op) = op {
                    self.invalidate(vec![op.metadata.invalidate_tags.clone()]).await;
                }
                None
            }
            (_, None) => None,
            (ConflictResolution::UseLocal, Some(op)) => Some((op.mutation.clone(), op)),
            (ConflictResolution::Merge(data), Some(op)) => {
                resolved.merged_data = Some(data.clone());
                Some((op.mutation.clone().with_data(data.clone()), op))
            }
        };

        info!(operation_id, resolution = ?resolution, "[Queue] Conflict resolved");
        push_bounded(
            &mut self.state.lock().history,
            resolved,
            self.config.conflict_history,
        );

        if let Some((mutation, op)) = requeue {
            let opts = EnqueueOptions {
                priority: op.priority,
                max_retries: Some(op.max_retries),
                metadata: OperationMetadata {
                    local_snapshot: None,
                    strategy: ResolutionStrategy::ClientWins,
                    invalidate_tags: op.metadata.invalidate_tags.clone(),
                },
            };
            self.enqueue(mutation, opts).await;
        } else {
            self.persist().await;
        }
        true
    }

    #[must_use]
    pub fn get_status(&self) -> QueueStatus {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        let mut by_priority = PriorityCounts::default();
        for op in &state.pending {
            match op.priority {
                OperationPriority::High => by_priority.high += 1,
                OperationPriority::Medium => by_priority.medium += 1,
                OperationPriority::Low => by_priority.low += 1,
            }
        }

        QueueStatus {
            total_operations: state.pending.len(),
            by_priority,
            oldest_age_ms: state
                .pending
                .iter()
                .map(|op| now.saturating_sub(op.enqueued_at))
                .max(),
            conflict_count: state.conflicts.len(),
            failed_count: state.failed.len(),
            is_processing: self.processing.load(Ordering::Acquire),
        }
    }

    /// Pending operations in replay order
    #[must_use]
    pub fn pending_operations(&self) -> Vec<QueuedOperation> {
        let mut pending = self.state.lock().pending.clone();
        pending.sort_by_key(|op| (Reverse(op.priority), op.enqueued_at));
        pending
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop pending operations older than the retention window
    pub async fn cleanup_stale(&self) -> usize {
        let now = self.clock.now_millis();
        let retention = duration_millis(self.config.retention);
        let removed = {
            let mut state = self.state.lock();
            let before = state.pending.len();
            state
                .pending
                .retain(|op| now.saturating_sub(op.enqueued_at) <= retention);
            before - state.pending.len()
        };

        if removed > 0 {
            info!(removed, "[Queue] Dropped stale operations");
            self.persist().await;
        }
        removed
    }

    #[must_use]
    pub fn get_failed_operations(&self) -> Vec<PermanentFailure> {
        self.state.lock().failed.clone()
    }

    pub async fn clear_failed_operations(&self) -> usize {
        let cleared = std::mem::take(&mut self.state.lock().failed).len();
        if cleared > 0 {
            self.persist().await;
        }
        cleared
    }

    /// Run [`cleanup_stale`](Self::cleanup_stale) every `cleanup_interval`
    pub fn start_retention_cleanup(self: &Arc<Self>, scheduler: &Scheduler) {
        let weak = Arc::downgrade(self);
        scheduler.every(RETENTION_TASK, self.config.cleanup_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(queue) = weak.upgrade() {
                    queue.cleanup_stale().await;
                }
            }
        });
    }
}

/// Evict until one more operation fits: oldest low first, then medium, then high
fn make_room(pending: &mut Vec<QueuedOperation>, max: usize) -> Vec<QueuedOperation> {
    let mut evicted = Vec::new();
    while pending.len() >= max.max(1) {
        let victim = [
            OperationPriority::Low,
            OperationPriority::Medium,
            OperationPriority::High,
        ]
        .into_iter()
        .find_map(|priority| {
            pending
                .iter()
                .enumerate()
                .filter(|(_, op)| op.priority == priority)
                .min_by_key(|(_, op)| op.enqueued_at)
                .map(|(pos, _)| pos)
        });
        match victim {
            Some(pos) => evicted.push(pending.remove(pos)),
            None => break,
        }
    }
    evicted
}

fn record_failure(state: &mut QueueState, op: QueuedOperation, error: QueryError, now: u64) {
    error!(
        operation_id = %op.id,
        table = op.table(),
        action = %op.kind(),
        retries = op.retry_count,
        error = %error,
        "[Queue] Operation permanently failed"
    );
    if op.priority == OperationPriority::High {
        state.failed.push(PermanentFailure {
            operation: op,
            error,
            failed_at: now,
        });
    }
}

fn push_bounded(history: &mut VecDeque<ConflictRecord>, record: ConflictRecord, cap: usize) {
    if cap == 0 {
        return;
    }
    while history.len() >= cap {
        history.pop_front();
    }
    history.push_back(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryKeyValueStore;
    use crate::clock::ManualClock;
    use crate::network::ConnectivitySignal;
    use crate::remote::{ChangeFilter, ChangeStream};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedRemote {
        applied: Mutex<Vec<Mutation>>,
        failure: Mutex<Option<QueryError>>,
        records: Mutex<HashMap<String, Value>>,
        delay: Option<Duration>,
    }

    impl ScriptedRemote {
        fn fail_with(&self, error: Option<QueryError>) {
            *self.failure.lock() = error;
        }

        fn applied_tables(&self) -> Vec<String> {
            self.applied
                .lock()
                .iter()
                .map(|m| m.table().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl RemoteLink for ScriptedRemote {
        async fn apply(&self, mutation: &Mutation) -> Result<Value, QueryError> {
            self.applied.lock().push(mutation.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.failure.lock().clone() {
                Some(error) => Err(error),
                None => Ok(mutation.data().cloned().unwrap_or(Value::Null)),
            }
        }

        async fn fetch_record(&self, table: &str, id: &str) -> Result<Option<Value>, QueryError> {
            Ok(self.records.lock().get(&format!("{table}/{id}")).cloned())
        }

        async fn ping(&self) -> Result<(), QueryError> {
            Ok(())
        }

        async fn subscribe_changes(&self, _filter: &ChangeFilter) -> Result<ChangeStream, QueryError> {
            Ok(Box::pin(futures_util::stream::empty()))
        }
    }

    struct Harness {
        queue: Arc<OfflineQueue>,
        remote: Arc<ScriptedRemote>,
        store: Arc<MemoryKeyValueStore>,
        monitor: Arc<NetworkMonitor>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(config: QueueConfig, remote: ScriptedRemote) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let monitor = Arc::new(NetworkMonitor::new(clock.clone()));
        monitor.apply_signal(&ConnectivitySignal::wifi());
        let remote = Arc::new(remote);
        let store = Arc::new(MemoryKeyValueStore::new());
        let queue = OfflineQueue::new(
            store.clone(),
            remote.clone(),
            monitor.clone(),
            config,
            clock.clone(),
        )
        .with_backoff(RetryPolicy::default().with_jitter(0.0));
        Harness {
            queue: Arc::new(queue),
            remote,
            store,
            monitor,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(QueueConfig::default(), ScriptedRemote::default())
    }

    impl Harness {
        async fn enqueue(&self, table: &str, priority: OperationPriority) -> String {
            self.clock.advance(Duration::from_millis(1));
            self.queue
                .enqueue(
                    Mutation::insert(table, json!({"name": table})),
                    EnqueueOptions::new().with_priority(priority),
                )
                .await
        }
    }

    #[tokio::test]
    async fn test_replay_order_priority_then_age() {
        let h = harness();
        h.enqueue("low", OperationPriority::Low).await;
        h.enqueue("high-1", OperationPriority::High).await;
        h.enqueue("medium", OperationPriority::Medium).await;
        h.enqueue("high-2", OperationPriority::High).await;

        let report = h.queue.process_queue().await;

        assert_eq!(report.completed, 4);
        assert_eq!(h.remote.applied_tables(), vec!["high-1", "high-2", "medium", "low"]);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_attempts_three_times() {
        let h = harness();
        h.remote.fail_with(Some(QueryError::new(ErrorKind::ServerError, "boom")));
        h.queue
            .enqueue(
                Mutation::insert("progress", json!({"score": 1})),
                EnqueueOptions::new()
                    .with_priority(OperationPriority::High)
                    .with_max_retries(2),
            )
            .await;

        let first = h.queue.process_queue().await;
        assert_eq!(first.requeued, 1);
        assert_eq!(h.queue.pending_operations()[0].retry_count, 1);

        // Still inside the backoff window
        let gated = h.queue.process_queue().await;
        assert_eq!(gated.attempted, 0);
        assert_eq!(gated.deferred, 1);

        h.clock.advance(Duration::from_secs(60));
        h.queue.process_queue().await;
        h.clock.advance(Duration::from_secs(60));
        let last = h.queue.process_queue().await;

        assert_eq!(last.failed, 1);
        assert_eq!(h.remote.applied.lock().len(), 3);
        assert!(h.queue.is_empty());
        let failed = h.queue.get_failed_operations();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.kind, ErrorKind::ServerError);

        assert_eq!(h.queue.clear_failed_operations().await, 1);
        assert!(h.queue.get_failed_operations().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let h = harness();
        h.remote.fail_with(Some(QueryError::classify(None, Some("23505"), "duplicate key")));
        h.enqueue("medium", OperationPriority::Medium).await;
        h.enqueue("high", OperationPriority::High).await;

        let report = h.queue.process_queue().await;

        assert_eq!(report.failed, 2);
        assert_eq!(h.remote.applied.lock().len(), 2);
        // Only high-priority failures are kept for review
        let failed = h.queue.get_failed_operations();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].operation.table(), "high");
    }

    #[tokio::test]
    async fn test_network_loss_stops_pass_without_consuming_retries() {
        let config = QueueConfig {
            batch_size: 1,
            ..QueueConfig::default()
        };
        let h = harness_with(config, ScriptedRemote::default());
        h.remote.fail_with(Some(QueryError::network("fetch failed")));
        h.enqueue("a", OperationPriority::Medium).await;
        h.enqueue("b", OperationPriority::Medium).await;

        let report = h.queue.process_queue().await;

        assert_eq!(report.attempted, 1);
        assert_eq!(h.queue.len(), 2);
        assert!(h.queue.pending_operations().iter().all(|op| op.retry_count == 0));
    }

    #[tokio::test]
    async fn test_skipped_while_offline() {
        let h = harness();
        h.enqueue("a", OperationPriority::High).await;
        h.monitor.apply_signal(&ConnectivitySignal::offline());

        let report = h.queue.process_queue().await;

        assert!(report.skipped);
        assert!(h.remote.applied.lock().is_empty());
        assert_eq!(h.queue.len(), 1);
    }

    fn stale_update(snapshot_ts: &str) -> (Mutation, EnqueueOptions) {
        (
            Mutation::update("profiles", "p1", json!({"bio": "local edit"})),
            EnqueueOptions::new().with_snapshot(json!({"id": "p1", "updated_at": snapshot_ts})),
        )
    }

    #[tokio::test]
    async fn test_conflict_detected_for_stale_snapshot() {
        let h = harness();
        h.remote.records.lock().insert(
            "profiles/p1".into(),
            json!({"id": "p1", "bio": "server", "updated_at": "2024-05-01T12:00:00Z"}),
        );

        let (mutation, opts) = stale_update("2024-05-01T11:00:00Z");
        let id = h.queue.enqueue(mutation, opts).await;
        let report = h.queue.process_queue().await;

        assert_eq!(report.conflicts, 1);
        assert!(h.remote.applied.lock().is_empty());
        let conflicts = h.queue.get_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].operation_id, id);
        assert_eq!(conflicts[0].kind, ConflictKind::DataConflict);
        assert_eq!(h.queue.get_status().conflict_count, 1);
    }

    #[tokio::test]
    async fn test_no_conflict_for_newer_snapshot() {
        let h = harness();
        h.remote.records.lock().insert(
            "profiles/p1".into(),
            json!({"id": "p1", "updated_at": "2024-05-01T12:00:00Z"}),
        );

        let (mutation, opts) = stale_update("2024-05-01T12:30:00Z");
        h.queue.enqueue(mutation, opts).await;
        let report = h.queue.process_queue().await;

        assert_eq!(report.conflicts, 0);
        assert_eq!(report.completed, 1);
        assert!(h.queue.get_conflicts().is_empty());
    }

    #[tokio::test]
    async fn test_merge_strategy_writes_merged_record() {
        let h = harness();
        h.remote.records.lock().insert(
            "profiles/p1".into(),
            json!({"id": "p1", "bio": "server", "version": 3, "updated_at": 2_000}),
        );

        let (mutation, opts) = stale_update("1970-01-01T00:00:01Z");
        h.queue
            .enqueue(mutation, opts.with_strategy(ResolutionStrategy::Merge))
            .await;
        let report = h.queue.process_queue().await;

        assert_eq!(report.completed, 1);
        let applied = h.remote.applied.lock().clone();
        let data = applied[0].data().cloned().unwrap();
        assert_eq!(data["bio"], "local edit");
        assert_eq!(data["version"], 3);
        assert_eq!(h.queue.get_conflict_history().len(), 1);
        assert!(h.queue.get_conflicts().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_conflict_use_local_requeues() {
        let h = harness();
        h.remote.records.lock().insert(
            "profiles/p1".into(),
            json!({"id": "p1", "updated_at": 5_000}),
        );
        let (mutation, opts) = stale_update("1970-01-01T00:00:01Z");
        let id = h.queue.enqueue(mutation, opts).await;
        h.queue.process_queue().await;

        assert!(!h.queue.resolve_conflict("missing", ConflictResolution::UseLocal).await);
        assert!(h.queue.resolve_conflict(&id, ConflictResolution::UseLocal).await);
        assert!(h.queue.get_conflicts().is_empty());
        assert_eq!(h.queue.len(), 1);

        let report = h.queue.process_queue().await;
        assert_eq!(report.completed, 1);
        assert_eq!(h.remote.applied_tables(), vec!["profiles"]);
    }

    #[tokio::test]
    async fn test_remote_conflict_error_is_parked() {
        let h = harness();
        h.remote.fail_with(Some(QueryError::classify(Some(409), None, "conflict")));
        let id = h.enqueue("lessons", OperationPriority::Medium).await;

        h.queue.process_queue().await;

        let conflicts = h.queue.get_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].operation_id, id);
        assert!(conflicts[0].remote_data.is_none());
        assert!(h.queue.resolve_conflict(&id, ConflictResolution::UseRemote).await);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest_low_first() {
        let config = QueueConfig {
            max_queue_size: 3,
            ..QueueConfig::default()
        };
        let h = harness_with(config, ScriptedRemote::default());
        h.enqueue("high", OperationPriority::High).await;
        h.enqueue("low-old", OperationPriority::Low).await;
        h.enqueue("low-new", OperationPriority::Low).await;
        h.enqueue("medium", OperationPriority::Medium).await;

        let tables: Vec<String> = h
            .queue
            .pending_operations()
            .iter()
            .map(|op| op.table().to_string())
            .collect();
        assert_eq!(tables, vec!["high", "medium", "low-new"]);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let h = harness();
        h.enqueue("a", OperationPriority::High).await;
        h.enqueue("b", OperationPriority::Low).await;

        let reloaded = OfflineQueue::new(
            h.store.clone(),
            h.remote.clone(),
            h.monitor.clone(),
            QueueConfig::default(),
            h.clock.clone(),
        );
        assert_eq!(reloaded.init().await.unwrap(), 2);
        let status = reloaded.get_status();
        assert_eq!(status.by_priority.high, 1);
        assert_eq!(status.by_priority.low, 1);
    }

    #[tokio::test]
    async fn test_cleanup_stale_drops_old_operations() {
        let h = harness();
        h.enqueue("old", OperationPriority::High).await;
        h.clock.advance(Duration::from_secs(8 * 24 * 3600));
        h.enqueue("fresh", OperationPriority::Low).await;

        assert_eq!(h.queue.cleanup_stale().await, 1);
        assert_eq!(h.queue.pending_operations()[0].table(), "fresh");
        assert_eq!(h.queue.get_status().oldest_age_ms, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_queue_is_single_flight() {
        let remote = ScriptedRemote {
            delay: Some(Duration::from_secs(10)),
            ..ScriptedRemote::default()
        };
        let h = harness_with(QueueConfig::default(), remote);
        h.enqueue("a", OperationPriority::High).await;

        let queue = Arc::clone(&h.queue);
        let first = tokio::spawn(async move { queue.process_queue().await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(h.queue.get_status().is_processing);
        let second = h.queue.process_queue().await;
        assert!(second.skipped);

        let first = first.await.unwrap();
        assert_eq!(first.completed, 1);
        assert_eq!(h.remote.applied.lock().len(), 1);
    }
}

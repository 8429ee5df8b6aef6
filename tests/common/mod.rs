//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - A scriptable in-memory backend implementing `RemoteLink`
//! - Test data generators
//! - A fully wired `SyncCore` fixture on a manual clock

#![allow(dead_code)]

use async_trait::async_trait;
use offline_cache_sync::{
    ChangeEvent, ChangeFilter, ChangeStream, CoreConfig, KeyValueStore, ManualClock, Mutation,
    QueryError, RemoteLink, SyncCore,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Hex AES-256 key for encrypted strategies
pub const TEST_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// Epoch millis the fixture clock starts at
pub const START_MILLIS: u64 = 1_700_000_000_000;

/// In-memory backend: rows keyed `table/id`, a reachability switch and a
/// queue of scripted failures
pub struct MockRemote {
    reachable: AtomicBool,
    pub records: Mutex<HashMap<String, Value>>,
    /// Every apply call, including failed ones, in call order
    pub applied: Mutex<Vec<Mutation>>,
    failures: Mutex<VecDeque<QueryError>>,
    /// Returned on every apply while set
    always_fail: Mutex<Option<QueryError>>,
    changes: Mutex<Option<mpsc::UnboundedReceiver<Result<ChangeEvent, QueryError>>>>,
    change_tx: mpsc::UnboundedSender<Result<ChangeEvent, QueryError>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        let (change_tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            records: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            changes: Mutex::new(Some(rx)),
            change_tx,
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next apply with `error`
    pub fn fail_next(&self, error: QueryError) {
        self.failures.lock().push_back(error);
    }

    pub fn fail_always(&self, error: Option<QueryError>) {
        *self.always_fail.lock() = error;
    }

    pub fn put_record(&self, table: &str, id: &str, record: Value) {
        self.records.lock().insert(format!("{table}/{id}"), record);
    }

    pub fn record(&self, table: &str, id: &str) -> Option<Value> {
        self.records.lock().get(&format!("{table}/{id}")).cloned()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().len()
    }

    /// Push a row change to the subscribed change stream
    pub fn emit_change(&self, event: ChangeEvent) {
        let _ = self.change_tx.send(Ok(event));
    }

    fn check_reachable(&self) -> Result<(), QueryError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueryError::network("Failed to fetch"))
        }
    }
}

#[async_trait]
impl RemoteLink for MockRemote {
    async fn apply(&self, mutation: &Mutation) -> Result<Value, QueryError> {
        self.check_reachable()?;
        self.applied.lock().push(mutation.clone());
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.always_fail.lock().clone() {
            return Err(error);
        }

        let mut records = self.records.lock();
        match mutation {
            Mutation::Insert { table, data } => {
                let id = mutation
                    .record_id()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let mut row = data.clone();
                row["id"] = json!(id);
                records.insert(format!("{table}/{id}"), row.clone());
                Ok(row)
            }
            Mutation::Update { table, id, data } => {
                let key = format!("{table}/{id}");
                let mut row = records.get(&key).cloned().unwrap_or_else(|| json!({"id": id}));
                if let (Some(row), Some(patch)) = (row.as_object_mut(), data.as_object()) {
                    for (field, value) in patch {
                        row.insert(field.clone(), value.clone());
                    }
                }
                records.insert(key, row.clone());
                Ok(row)
            }
            Mutation::Delete { table, id } => {
                records.remove(&format!("{table}/{id}"));
                Ok(Value::Null)
            }
        }
    }

    async fn fetch_record(&self, table: &str, id: &str) -> Result<Option<Value>, QueryError> {
        self.check_reachable()?;
        Ok(self.record(table, id))
    }

    async fn ping(&self) -> Result<(), QueryError> {
        self.check_reachable()
    }

    async fn subscribe_changes(&self, _filter: &ChangeFilter) -> Result<ChangeStream, QueryError> {
        match self.changes.lock().take() {
            Some(rx) => Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            }))),
            None => Ok(Box::pin(futures_util::stream::pending())),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Configuration used by the fixtures: encryption key set, short intervals
pub fn test_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.coordinator.encryption_key = Some(TEST_KEY_HEX.to_string());
    config
}

/// A wired core over `remote` on a manual clock
pub struct TestCore {
    pub core: SyncCore,
    pub remote: Arc<MockRemote>,
    pub clock: Arc<ManualClock>,
}

pub fn build_core(config: CoreConfig) -> TestCore {
    build_core_with(config, MockRemote::new(), None)
}

pub fn build_core_with(
    config: CoreConfig,
    remote: Arc<MockRemote>,
    store: Option<Arc<dyn KeyValueStore>>,
) -> TestCore {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let mut builder = SyncCore::builder(remote.clone())
        .with_config(config)
        .with_clock(clock.clone());
    if let Some(store) = store {
        builder = builder.with_key_value_store(store);
    }
    let core = builder.build().unwrap();
    TestCore { core, remote, clock }
}

/// Lesson payload of roughly `bytes` bytes
pub fn lesson(id: u32, bytes: usize) -> Value {
    json!({
        "id": id,
        "title": format!("Lesson {id}"),
        "body": "x".repeat(bytes),
    })
}

pub fn profile(id: &str, updated_at: &str) -> Value {
    json!({
        "id": id,
        "display_name": format!("Student {id}"),
        "updated_at": updated_at,
    })
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

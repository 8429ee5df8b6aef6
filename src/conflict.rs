//! Conflict detection and resolution for replayed writes
//!
//! A queued update may carry the snapshot of the row it was based on. At
//! replay time the snapshot is compared against the server copy:
//!
//! - both records carry an integer `version`: conflict when the server's is higher
//! - otherwise: conflict when the server's `updated_at` is newer than the snapshot's
//!
//! The timestamp comparison is a heuristic. It is only as good as the clocks
//! that produced the timestamps, which is why the version counter wins
//! whenever both sides have one.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::offline_queue::QueuedOperation;

/// Server-owned fields a merge always takes from the remote record
pub const SYSTEM_FIELDS: [&str; 5] = ["id", "created_at", "updated_at", "version", "user_id"];

/// What kind of disagreement was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Server copy modified after the local snapshot (timestamp heuristic)
    DataConflict,
    /// Server version counter ahead of the local snapshot
    VersionConflict,
    /// Backend rejected the write as violating a constraint while reporting a conflict
    ConstraintViolation,
}

/// How a detected conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Write the local data anyway
    ClientWins,
    /// Drop the local write
    ServerWins,
    /// Server-owned fields from the remote record, everything else local
    Merge,
    /// Park the conflict until [`resolve_conflict`](crate::OfflineQueue::resolve_conflict)
    #[default]
    Manual,
}

/// Decision for a manually parked conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "use", content = "data", rename_all = "snake_case")]
pub enum ConflictResolution {
    UseLocal,
    UseRemote,
    Merge(Value),
}

/// A disagreement between a queued write and the server state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub operation_id: String,
    pub kind: ConflictKind,
    pub table: String,
    pub record_id: Option<String>,
    pub local_data: Value,
    /// Server copy at detection time; absent when the backend only reported an error
    pub remote_data: Option<Value>,
    pub strategy: ResolutionStrategy,
    pub merged_data: Option<Value>,
    pub detected_at: u64,
    #[serde(default)]
    pub resolved_at: Option<u64>,
    /// The parked write, kept for manual conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Box<QueuedOperation>>,
}

/// Compare a local snapshot against the current server copy
#[must_use]
pub fn detect_conflict(local: &Value, remote: &Value) -> Option<ConflictKind> {
    if let (Some(local_version), Some(remote_version)) = (version_of(local), version_of(remote)) {
        return (remote_version > local_version).then_some(ConflictKind::VersionConflict);
    }

    let local_ts = local.get("updated_at").and_then(timestamp_millis);
    let remote_ts = remote.get("updated_at").and_then(timestamp_millis);
    match (local_ts, remote_ts) {
        (Some(local_ts), Some(remote_ts)) if remote_ts > local_ts => Some(ConflictKind::DataConflict),
        _ => None,
    }
}

/// Local values for user fields, remote values for `system_fields`
#[must_use]
pub fn merge_records(local: &Value, remote: &Value, system_fields: &[String]) -> Value {
    let mut merged: Map<String, Value> = match remote {
        Value::Object(remote) => remote.clone(),
        _ => Map::new(),
    };
    if let Value::Object(local) = local {
        for (field, value) in local {
            if !system_fields.iter().any(|f| f == field) {
                merged.insert(field.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

/// Default system fields plus configured extras
#[must_use]
pub fn system_fields_with(extra: &[String]) -> Vec<String> {
    SYSTEM_FIELDS
        .iter()
        .map(|f| (*f).to_string())
        .chain(extra.iter().cloned())
        .collect()
}

fn version_of(record: &Value) -> Option<i64> {
    record.get("version")?.as_i64()
}

/// RFC 3339 string or epoch-millisecond number
fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis()),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_newer_remote_timestamp_conflicts() {
        let local = json!({"updated_at": "2024-03-01T10:00:00Z"});
        let remote = json!({"updated_at": "2024-03-01T10:05:00+00:00"});
        assert_eq!(detect_conflict(&local, &remote), Some(ConflictKind::DataConflict));
        assert_eq!(detect_conflict(&remote, &local), None);
    }

    #[test]
    fn test_epoch_millis_timestamps() {
        let local = json!({"updated_at": 1_000});
        let remote = json!({"updated_at": 2_000});
        assert!(detect_conflict(&local, &remote).is_some());
    }

    #[test]
    fn test_version_counter_takes_precedence() {
        // Timestamps say conflict, versions agree
        let local = json!({"version": 4, "updated_at": 1_000});
        let remote = json!({"version": 4, "updated_at": 9_000});
        assert_eq!(detect_conflict(&local, &remote), None);

        let remote = json!({"version": 5, "updated_at": 500});
        assert_eq!(detect_conflict(&local, &remote), Some(ConflictKind::VersionConflict));
    }

    #[test]
    fn test_missing_timestamps_never_conflict() {
        assert_eq!(detect_conflict(&json!({}), &json!({"updated_at": 5})), None);
    }

    #[test]
    fn test_merge_keeps_system_fields_from_remote() {
        let local = json!({"id": "x", "title": "local", "version": 1, "notes": "mine"});
        let remote = json!({"id": "x", "title": "remote", "version": 3, "user_id": "u1", "score": 10});
        let merged = merge_records(&local, &remote, &system_fields_with(&[]));

        assert_eq!(merged["title"], "local");
        assert_eq!(merged["notes"], "mine");
        assert_eq!(merged["version"], 3);
        assert_eq!(merged["user_id"], "u1");
        assert_eq!(merged["score"], 10);
    }

    #[test]
    fn test_merge_with_extra_system_fields() {
        let fields = system_fields_with(&["score".to_string()]);
        let merged = merge_records(&json!({"score": 1}), &json!({"score": 2}), &fields);
        assert_eq!(merged["score"], 2);
    }
}

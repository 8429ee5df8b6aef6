//! Remote backend collaborators
//!
//! The core never talks to a concrete backend client. Writes are described
//! as [`Mutation`] values (a closed set of table operations) and dispatched
//! through a [`RemoteLink`]; reads go through caller-supplied closures in
//! the query executor.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::QueryError;

/// Write operation against one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Mutation {
    Insert { table: String, data: Value },
    Update { table: String, id: String, data: Value },
    Delete { table: String, id: String },
}

/// Action kind of a [`Mutation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

impl Mutation {
    pub fn insert(table: impl Into<String>, data: Value) -> Self {
        Self::Insert {
            table: table.into(),
            data,
        }
    }

    pub fn update(table: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self::Update {
            table: table.into(),
            id: id.into(),
            data,
        }
    }

    pub fn delete(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Delete {
            table: table.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                table
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Insert { .. } => MutationKind::Insert,
            Self::Update { .. } => MutationKind::Update,
            Self::Delete { .. } => MutationKind::Delete,
        }
    }

    /// Target row id; for inserts, the `id` field of the payload if present
    #[must_use]
    pub fn record_id(&self) -> Option<String> {
        match self {
            Self::Update { id, .. } | Self::Delete { id, .. } => Some(id.clone()),
            Self::Insert { data, .. } => match data.get("id")? {
                Value::String(id) => Some(id.clone()),
                Value::Number(id) => Some(id.to_string()),
                _ => None,
            },
        }
    }

    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Insert { data, .. } | Self::Update { data, .. } => Some(data),
            Self::Delete { .. } => None,
        }
    }

    /// Same operation with a replaced payload; deletes are returned unchanged
    #[must_use]
    pub fn with_data(self, data: Value) -> Self {
        match self {
            Self::Insert { table, .. } => Self::Insert { table, data },
            Self::Update { table, id, .. } => Self::Update { table, id, data },
            delete @ Self::Delete { .. } => delete,
        }
    }
}

/// Row-level change notification filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    /// Tables to watch; empty means all
    pub tables: Vec<String>,
    /// Backend-specific row predicate, e.g. `user_id=eq.42`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
}

impl ChangeFilter {
    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            predicate: None,
        }
    }

    #[must_use]
    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    #[must_use]
    pub fn matches(&self, table: &str) -> bool {
        self.tables.is_empty() || self.tables.iter().any(|t| t == table)
    }
}

/// One row change pushed by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: MutationKind,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, QueryError>>;

/// Live link to the remote backend
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the executor, queue and supervisor
/// share one link.
#[async_trait]
pub trait RemoteLink: Send + Sync {
    /// Apply a mutation, returning the row(s) the backend reports back
    async fn apply(&self, mutation: &Mutation) -> Result<Value, QueryError>;

    /// Current server copy of a row, used for conflict detection
    async fn fetch_record(&self, table: &str, id: &str) -> Result<Option<Value>, QueryError>;

    /// Cheap round-trip proving the backend is reachable
    async fn ping(&self) -> Result<(), QueryError>;

    /// Row-level change notifications; the stream ends or yields an error
    /// when the subscription drops
    async fn subscribe_changes(&self, filter: &ChangeFilter) -> Result<ChangeStream, QueryError>;

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Session refresh collaborator, invoked on `AuthExpired`
#[async_trait]
pub trait AuthRefresher: Send + Sync {
    async fn refresh_session(&self) -> Result<(), QueryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutation_is_tagged_by_action() {
        let mutation = Mutation::update("lessons", "l1", json!({"title": "Fractions"}));
        let encoded = serde_json::to_value(&mutation).unwrap();
        assert_eq!(encoded["action"], "update");
        assert_eq!(encoded["table"], "lessons");

        let decoded: Mutation = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, mutation);
    }

    #[test]
    fn test_insert_record_id_from_payload() {
        assert_eq!(
            Mutation::insert("t", json!({"id": 7})).record_id().as_deref(),
            Some("7")
        );
        assert_eq!(Mutation::insert("t", json!({"x": 1})).record_id(), None);
        assert_eq!(Mutation::delete("t", "a").record_id().as_deref(), Some("a"));
    }

    #[test]
    fn test_with_data_keeps_target() {
        let merged = Mutation::update("t", "1", json!({"a": 1})).with_data(json!({"a": 2}));
        assert_eq!(merged, Mutation::update("t", "1", json!({"a": 2})));
        assert_eq!(Mutation::delete("t", "1").with_data(json!({})), Mutation::delete("t", "1"));
    }

    #[test]
    fn test_change_filter_matches() {
        assert!(ChangeFilter::default().matches("anything"));
        let filter = ChangeFilter::tables(["lessons"]).with_predicate("user_id=eq.1");
        assert!(filter.matches("lessons"));
        assert!(!filter.matches("profiles"));
    }
}

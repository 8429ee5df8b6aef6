//! Error Taxonomy
//!
//! Every failure that reaches a caller is described by an [`ErrorKind`], which
//! decides how the core reacts to it:
//!
//! | Kind | Reaction |
//! |---|---|
//! | `NetworkUnavailable` | reads miss, writes are queued offline |
//! | `Timeout`, `RateLimited`, `ServerError` | retried with backoff |
//! | `AuthExpired` | session refresh, then one retry |
//! | `PermissionDenied`, `ConstraintViolation` | surfaced immediately |
//! | `DataConflict` | turned into a conflict record |
//!
//! [`CoreError`] is reserved for construction-time problems (bad configuration,
//! storage that cannot be opened).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification of a remote or local failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkUnavailable,
    Timeout,
    AuthExpired,
    PermissionDenied,
    DataConflict,
    ConstraintViolation,
    RateLimited,
    ServerError,
    Unknown,
}

impl ErrorKind {
    /// Whether a plain retry with backoff may succeed
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::ServerError)
    }

    /// Whether the failure must never be retried by the offline queue
    #[must_use]
    pub fn is_permanent(self) -> bool {
        matches!(self, Self::PermissionDenied | Self::ConstraintViolation)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkUnavailable => "network_unavailable",
            Self::Timeout => "timeout",
            Self::AuthExpired => "auth_expired",
            Self::PermissionDenied => "permission_denied",
            Self::DataConflict => "data_conflict",
            Self::ConstraintViolation => "constraint_violation",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by remote operations and surfaced in query results
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP-like status reported by the backend, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Backend error code (e.g. a SQLSTATE such as `23505`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            code: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkUnavailable, message)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("operation timed out after {}ms", after.as_millis()),
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataConflict, message)
    }

    /// Map a raw backend failure onto the taxonomy.
    ///
    /// Status codes take precedence over backend codes, which take precedence
    /// over message sniffing.
    pub fn classify(status: Option<u16>, code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = classify_kind(status, code, &message);
        Self {
            kind,
            message,
            status,
            code: code.map(str::to_string),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

fn classify_kind(status: Option<u16>, code: Option<&str>, message: &str) -> ErrorKind {
    match status {
        Some(401) => return ErrorKind::AuthExpired,
        Some(403) => return ErrorKind::PermissionDenied,
        Some(408 | 504) => return ErrorKind::Timeout,
        Some(409) => return ErrorKind::DataConflict,
        Some(429) => return ErrorKind::RateLimited,
        Some(s) if s >= 500 => return ErrorKind::ServerError,
        _ => {}
    }

    if let Some(code) = code {
        if code == "PGRST301" || code.eq_ignore_ascii_case("jwt_expired") {
            return ErrorKind::AuthExpired;
        }
        if code == "42501" {
            return ErrorKind::PermissionDenied;
        }
        if code == "40001" {
            return ErrorKind::DataConflict;
        }
        if code.starts_with("23") {
            return ErrorKind::ConstraintViolation;
        }
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if lower.contains("jwt expired") || lower.contains("token expired") {
        ErrorKind::AuthExpired
    } else if lower.contains("network")
        || lower.contains("fetch failed")
        || lower.contains("connection refused")
        || lower.contains("offline")
    {
        ErrorKind::NetworkUnavailable
    } else if lower.contains("rate limit") || lower.contains("too many requests") {
        ErrorKind::RateLimited
    } else {
        ErrorKind::Unknown
    }
}

/// Construction and initialization failures
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage initialization failed: {0}")]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_take_precedence() {
        let err = QueryError::classify(Some(401), Some("23505"), "duplicate key");
        assert_eq!(err.kind, ErrorKind::AuthExpired);

        let err = QueryError::classify(Some(503), None, "upstream unavailable");
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_sqlstate_codes() {
        assert_eq!(
            QueryError::classify(None, Some("23505"), "duplicate key value").kind,
            ErrorKind::ConstraintViolation
        );
        assert_eq!(
            QueryError::classify(None, Some("42501"), "rls").kind,
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            QueryError::classify(None, Some("PGRST301"), "JWT expired").kind,
            ErrorKind::AuthExpired
        );
    }

    #[test]
    fn test_message_sniffing() {
        assert_eq!(
            QueryError::classify(None, None, "TypeError: Network request failed").kind,
            ErrorKind::NetworkUnavailable
        );
        assert_eq!(
            QueryError::classify(None, None, "request timed out").kind,
            ErrorKind::Timeout
        );
        assert_eq!(
            QueryError::classify(None, None, "something odd").kind,
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_retry_policy_by_kind() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::AuthExpired.is_retryable());
        assert!(!ErrorKind::DataConflict.is_retryable());
        assert!(!ErrorKind::NetworkUnavailable.is_retryable());
        assert!(ErrorKind::ConstraintViolation.is_permanent());
    }
}

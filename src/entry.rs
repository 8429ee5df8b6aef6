//! Cache entry model
//!
//! A [`CacheEntry`] is the unit every tier stores. Its payload is an
//! [`Envelope`], the serialized form `{compressed?, encrypted?, data}` that lets
//! a reader tell transformed payloads apart without any side metadata.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::clock::duration_millis;

/// Write priority of a cache entry, lowest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl CachePriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse the stored column form; unknown values fall back to `Medium`
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "low" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Medium,
        }
    }
}

impl fmt::Display for CachePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three storage tiers, fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Memory,
    Persistent,
    Relational,
}

impl TierKind {
    pub const ALL: [TierKind; 3] = [Self::Memory, Self::Persistent, Self::Relational];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Memory => 0,
            Self::Persistent => 1,
            Self::Relational => 2,
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Persistent => "persistent",
            Self::Relational => "relational",
        })
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Serialized payload of a cache entry.
///
/// When neither flag is set `data` is the original JSON value. Otherwise
/// `data` is a base64 string holding the compressed and/or encrypted bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "is_false")]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    pub data: serde_json::Value,
}

impl Envelope {
    #[must_use]
    pub fn plain(data: serde_json::Value) -> Self {
        Self {
            compressed: false,
            encrypted: false,
            data,
        }
    }

    #[must_use]
    pub fn is_transformed(&self) -> bool {
        self.compressed || self.encrypted
    }
}

/// One cached value together with its bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub envelope: Envelope,
    /// Epoch millis
    pub created_at: u64,
    /// Epoch millis; the entry is valid strictly before this instant
    pub expires_at: u64,
    #[serde(default)]
    pub access_count: u64,
    pub last_accessed_at: u64,
    pub size_bytes: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub priority: CachePriority,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, envelope: Envelope, now: u64, ttl: Duration) -> Self {
        let size_bytes = estimate_size(&envelope);
        Self {
            key: key.into(),
            envelope,
            created_at: now,
            expires_at: now.saturating_add(duration_millis(ttl)),
            access_count: 0,
            last_accessed_at: now,
            size_bytes,
            tags: BTreeSet::new(),
            priority: CachePriority::default(),
        }
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn is_valid_at(&self, now: u64) -> bool {
        now < self.expires_at
    }

    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        !self.is_valid_at(now)
    }

    /// Time left before expiry, zero once expired
    #[must_use]
    pub fn remaining_ttl(&self, now: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }

    pub fn record_access(&mut self, now: u64) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = now;
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.envelope.compressed
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.envelope.encrypted
    }

    #[must_use]
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|tag| self.tags.contains(tag))
    }
}

/// Estimated serialized size of an envelope in bytes
#[must_use]
pub fn estimate_size(envelope: &Envelope) -> u64 {
    serde_json::to_vec(envelope).map_or(0, |bytes| bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validity_window() {
        let entry = CacheEntry::new("k", Envelope::plain(json!(1)), 1_000, Duration::from_secs(1));
        assert!(entry.is_valid_at(1_000));
        assert!(entry.is_valid_at(1_999));
        assert!(entry.is_expired_at(2_000));
        assert_eq!(entry.remaining_ttl(1_500), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_ttl_is_never_valid() {
        let entry = CacheEntry::new("k", Envelope::plain(json!(1)), 1_000, Duration::ZERO);
        assert!(entry.is_expired_at(1_000));
    }

    #[test]
    fn test_plain_envelope_omits_flags() {
        let encoded = serde_json::to_string(&Envelope::plain(json!({"a": 1}))).unwrap_or_default();
        assert_eq!(encoded, r#"{"data":{"a":1}}"#);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(CachePriority::Critical > CachePriority::High);
        assert!(CachePriority::Medium > CachePriority::Low);
        assert_eq!(CachePriority::parse("critical"), CachePriority::Critical);
        assert_eq!(CachePriority::parse("bogus"), CachePriority::Medium);
    }
}

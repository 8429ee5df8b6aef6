//! Per-entity cache strategies
//!
//! A [`StrategyTable`] is an ordered list of [`EntityStrategy`] rules. Lookup
//! walks the rules in insertion order and returns the first whose entity name
//! occurs in the cache key; keys matching nothing use the coordinator's
//! global defaults. Put more specific entities before the general ones they
//! contain (`student_profile` before `profile`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_ms;
use crate::entry::CachePriority;

/// TTL presets for common data lifetimes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Real-time data - 10 seconds
    RealTime,
    /// Short-term data - 5 minutes
    ShortTerm,
    /// Medium-term data - 1 hour
    MediumTerm,
    /// Long-term data - 3 hours
    LongTerm,
    /// Daily content - 24 hours
    Daily,
    /// Reference data - 7 days
    Weekly,
    Custom(Duration),
}

impl TtlClass {
    #[must_use]
    pub fn to_duration(self) -> Duration {
        match self {
            Self::RealTime => Duration::from_secs(10),
            Self::ShortTerm => Duration::from_secs(300),
            Self::MediumTerm => Duration::from_secs(3600),
            Self::LongTerm => Duration::from_secs(10800),
            Self::Daily => Duration::from_secs(86_400),
            Self::Weekly => Duration::from_secs(7 * 86_400),
            Self::Custom(duration) => duration,
        }
    }
}

/// Caching policy for one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStrategy {
    /// Matched as a substring of the cache key
    pub entity: String,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub priority: CachePriority,
    /// Whether large payloads of this entity may be compressed
    #[serde(default)]
    pub compress: bool,
    /// Whether payloads must be encrypted at rest
    #[serde(default)]
    pub encrypt: bool,
    /// Tags attached to every entry of this entity
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EntityStrategy {
    pub fn new(entity: impl Into<String>, ttl: TtlClass, priority: CachePriority) -> Self {
        Self {
            entity: entity.into(),
            ttl: ttl.to_duration(),
            priority,
            compress: false,
            encrypt: false,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    #[must_use]
    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
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
    pub fn matches(&self, key: &str) -> bool {
        key.contains(self.entity.as_str())
    }
}

/// Ordered, first-match-wins strategy lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyTable {
    rules: Vec<EntityStrategy>,
}

impl StrategyTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule; it is consulted after every rule already present
    #[must_use]
    pub fn with(mut self, rule: EntityStrategy) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn push(&mut self, rule: EntityStrategy) {
        self.rules.push(rule);
    }

    /// First rule whose entity occurs in `key`
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&EntityStrategy> {
        self.rules.iter().find(|rule| rule.matches(key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityStrategy> {
        self.rules.iter()
    }

    /// Rules for the learning app's entity types
    #[must_use]
    pub fn default_table() -> Self {
        Self::new()
            .with(
                EntityStrategy::new("student_profile", TtlClass::Custom(Duration::from_secs(30 * 60)), CachePriority::High)
                    .encrypted()
                    .with_tags(["student", "profile"]),
            )
            .with(
                EntityStrategy::new("learning_progress", TtlClass::Custom(Duration::from_secs(10 * 60)), CachePriority::High)
                    .with_tags(["progress", "student"]),
            )
            .with(
                EntityStrategy::new("assessment", TtlClass::MediumTerm, CachePriority::High)
                    .encrypted()
                    .with_tags(["assessment"]),
            )
            .with(
                EntityStrategy::new("lesson_content", TtlClass::Daily, CachePriority::Medium)
                    .compressed()
                    .with_tags(["lesson", "content"]),
            )
            .with(
                EntityStrategy::new("curriculum", TtlClass::Weekly, CachePriority::Low)
                    .compressed()
                    .with_tags(["curriculum", "content"]),
            )
            .with(
                EntityStrategy::new("ai_response", TtlClass::MediumTerm, CachePriority::Low)
                    .compressed()
                    .with_tags(["ai"]),
            )
            .with(
                EntityStrategy::new("user_preferences", TtlClass::Daily, CachePriority::Critical)
                    .with_tags(["preferences"]),
            )
            .with(
                EntityStrategy::new("leaderboard", TtlClass::ShortTerm, CachePriority::Low)
                    .with_tags(["leaderboard"]),
            )
    }
}

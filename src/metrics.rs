//! Per-call query metrics
//!
//! The most recent calls are kept in a bounded ring buffer; lifetime totals
//! are plain atomic counters.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::clock::duration_millis;
use crate::error::ErrorKind;
use crate::network::ConnectionQuality;

/// One executed call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetric {
    pub key: String,
    pub duration: Duration,
    pub from_cache: bool,
    /// Remote attempts made; zero for a cache hit
    pub attempts: u32,
    pub error: Option<ErrorKind>,
    pub quality: ConnectionQuality,
    /// Epoch millis at completion
    pub recorded_at: u64,
}

/// Aggregated view over all recorded calls
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryStats {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub failures: u64,
    /// Attempts beyond the first, summed over all calls
    pub retries: u64,
    pub timeouts: u64,
    pub slow_queries: u64,
    /// Mean latency over the retained window
    pub average_latency: Duration,
    pub window: usize,
}

/// Query metrics recorder
pub struct QueryMetrics {
    recent: Mutex<VecDeque<QueryMetric>>,
    capacity: usize,
    slow_threshold: Duration,
    total: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    slow: AtomicU64,
}

impl QueryMetrics {
    #[must_use]
    pub fn new(capacity: usize, slow_threshold: Duration) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            slow_threshold,
            total: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            slow: AtomicU64::new(0),
        }
    }

    pub fn record(&self, metric: QueryMetric) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if metric.from_cache {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        if metric.error.is_some() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        if metric.error == Some(ErrorKind::Timeout) {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        self.retries
            .fetch_add(u64::from(metric.attempts.saturating_sub(1)), Ordering::Relaxed);
        if metric.duration > self.slow_threshold {
            self.slow.fetch_add(1, Ordering::Relaxed);
            warn!(
                key = %metric.key,
                duration_ms = duration_millis(metric.duration),
                attempts = metric.attempts,
                quality = ?metric.quality,
                "Slow query"
            );
        }

        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(metric);
    }

    /// Retained calls, oldest first
    #[must_use]
    pub fn recent(&self) -> Vec<QueryMetric> {
        self.recent.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> QueryStats {
        let (average_latency, window) = {
            let recent = self.recent.lock();
            let total: Duration = recent.iter().map(|m| m.duration).sum();
            let count = u32::try_from(recent.len()).unwrap_or(u32::MAX);
            let average = if count == 0 { Duration::ZERO } else { total / count };
            (average, recent.len())
        };

        QueryStats {
            total_queries: self.total.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            slow_queries: self.slow.load(Ordering::Relaxed),
            average_latency,
            window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(key: &str, millis: u64, attempts: u32, error: Option<ErrorKind>) -> QueryMetric {
        QueryMetric {
            key: key.to_string(),
            duration: Duration::from_millis(millis),
            from_cache: attempts == 0,
            attempts,
            error,
            quality: ConnectionQuality::Good,
            recorded_at: 0,
        }
    }

    #[test]
    fn test_ring_buffer_keeps_most_recent() {
        let metrics = QueryMetrics::new(2, Duration::from_secs(2));
        metrics.record(metric("a", 10, 1, None));
        metrics.record(metric("b", 20, 1, None));
        metrics.record(metric("c", 30, 1, None));

        let keys: Vec<String> = metrics.recent().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["b", "c"]);

        let stats = metrics.stats();
        assert_eq!(stats.total_queries, 3);
        assert_eq!(stats.window, 2);
        assert_eq!(stats.average_latency, Duration::from_millis(25));
    }

    #[test]
    fn test_counters() {
        let metrics = QueryMetrics::new(10, Duration::from_millis(100));
        metrics.record(metric("hit", 1, 0, None));
        metrics.record(metric("retry", 50, 3, None));
        metrics.record(metric("slow", 500, 4, Some(ErrorKind::Timeout)));

        let stats = metrics.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.retries, 5);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.slow_queries, 1);
    }
}

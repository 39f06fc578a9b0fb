//! In-memory traffic log exposed through the admin API.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. This gives a bounded, O(1) memory
//! footprint regardless of request volume.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push] uses
/// a non-blocking `try_lock` so it never delays request handling; in the
/// unlikely event of lock contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    /// Create a new log with the given capacity.
    ///
    /// `capacity` is the maximum number of entries retained. Older entries are
    /// silently dropped once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed `optimize` call.
    ///
    /// This is a best-effort, non-blocking operation: if the mutex is contended
    /// the entry is dropped rather than blocking the request path.
    pub fn push(&self, entry: TrafficEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Compute aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();
        let cache_hit_count = entries.iter().filter(|e| e.cache_hit).count();
        let total_cost_eur = entries.iter().map(|e| e.cost_eur).sum();

        let mut backend_counts: HashMap<String, usize> = HashMap::new();
        for entry in entries.iter() {
            *backend_counts.entry(entry.backend.clone()).or_default() += 1;
        }

        TrafficStats {
            total_requests: total,
            error_count,
            cache_hit_count,
            avg_latency_ms,
            total_cost_eur,
            backend_counts,
        }
    }
}

/// A single `optimize` call record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub backend: String,
    pub cache_hit: bool,
    pub rag_status: Option<String>,
    pub latency_ms: u64,
    pub cost_eur: Decimal,
    pub success: bool,
    pub error: Option<String>,
}

impl TrafficEntry {
    pub fn new(backend: String, latency_ms: u64, cost_eur: Decimal, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            backend,
            cache_hit: false,
            rag_status: None,
            latency_ms,
            cost_eur,
            success,
            error: None,
        }
    }

    pub fn mark_cache_hit(mut self) -> Self {
        self.cache_hit = true;
        self
    }

    pub fn with_rag_status(mut self, status: &str) -> Self {
        self.rag_status = Some(status.to_string());
        self
    }

    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

/// Aggregate statistics derived from all buffered [`TrafficEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub cache_hit_count: usize,
    pub avg_latency_ms: f64,
    pub total_cost_eur: Decimal,
    pub backend_counts: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(backend: &str, latency_ms: u64) -> TrafficEntry {
        TrafficEntry::new(backend.into(), latency_ms, Decimal::ZERO, true)
    }

    #[tokio::test]
    async fn push_and_retrieve_single_entry() {
        let log = TrafficLog::new(10);
        log.push(make_entry("openai", 42));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].backend, "openai");
        assert_eq!(recent[0].latency_ms, 42);
    }

    #[tokio::test]
    async fn recent_returns_entries_newest_first() {
        let log = TrafficLog::new(10);
        log.push(make_entry("openai", 1));
        log.push(make_entry("anthropic", 2));
        log.push(make_entry("qwen", 3));

        let recent = log.recent(10).await;
        assert_eq!(recent[0].backend, "qwen");
        assert_eq!(recent[1].backend, "anthropic");
        assert_eq!(recent[2].backend, "openai");
    }

    #[tokio::test]
    async fn recent_limits_result_count() {
        let log = TrafficLog::new(20);
        for i in 0..10u64 {
            log.push(make_entry("openai", i));
        }
        let recent = log.recent(3).await;
        assert_eq!(recent.len(), 3);
    }

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let log = TrafficLog::new(3);
        log.push(make_entry("oldest", 1));
        log.push(make_entry("middle", 2));
        log.push(make_entry("newest", 3));
        log.push(make_entry("extra", 4));

        let all = log.recent(100).await;
        assert_eq!(all.len(), 3);
        assert!(!all.iter().any(|e| e.backend == "oldest"));
        assert!(all.iter().any(|e| e.backend == "extra"));
    }

    #[tokio::test]
    async fn stats_on_empty_log() {
        let log = TrafficLog::new(10);
        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.avg_latency_ms, 0.0);
        assert!(stats.backend_counts.is_empty());
    }

    #[tokio::test]
    async fn stats_averages_latency_and_sums_cost() {
        let log = TrafficLog::new(10);
        log.push(TrafficEntry::new("openai".into(), 100, Decimal::new(1, 2), true));
        log.push(TrafficEntry::new("openai".into(), 200, Decimal::new(2, 2), true));
        log.push(TrafficEntry::new("anthropic".into(), 300, Decimal::new(3, 2), true));

        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert!((stats.avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(stats.total_cost_eur, Decimal::new(6, 2));
    }

    #[tokio::test]
    async fn stats_counts_requests_per_backend() {
        let log = TrafficLog::new(10);
        log.push(make_entry("openai", 10));
        log.push(make_entry("openai", 20));
        log.push(make_entry("anthropic", 30));

        let stats = log.stats().await;
        assert_eq!(stats.backend_counts["openai"], 2);
        assert_eq!(stats.backend_counts["anthropic"], 1);
    }

    #[tokio::test]
    async fn stats_counts_cache_hits_separately_from_errors() {
        let log = TrafficLog::new(10);
        log.push(make_entry("openai", 10).mark_cache_hit());
        log.push(TrafficEntry::new("openai".into(), 10, Decimal::ZERO, false).with_error("boom"));

        let stats = log.stats().await;
        assert_eq!(stats.cache_hit_count, 1);
        assert_eq!(stats.error_count, 1);
    }

    #[test]
    fn entry_has_unique_ids() {
        let a = make_entry("openai", 1);
        let b = make_entry("openai", 1);
        assert_ne!(a.id, b.id, "every entry must have a unique UUID");
    }
}

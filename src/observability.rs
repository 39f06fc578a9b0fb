//! Lifetime counters, a latency histogram, and Prometheus exposition.
//!
//! Renders in the usual Prometheus exposition shape (sorted label rows,
//! `# HELP`/`# TYPE` pairs, `text/plain; version=0.0.4`) but is backed by
//! persistent atomic counters rather than a windowed
//! [`crate::traffic::TrafficLog`] scan, so the counter set outlives the
//! log's ring-buffer capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::breaker::BreakerState;

/// Upper bounds (ms) of the latency histogram's buckets, cumulative —
/// the last bucket is effectively `+Inf`.
const LATENCY_BUCKETS_MS: [u64; 8] = [50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

#[derive(Default)]
struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, latency_ms: u64) {
        for (bound, bucket) in LATENCY_BUCKETS_MS.iter().zip(&self.buckets) {
            if latency_ms <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Liveness view of one backend, assembled for [`crate::lifecycle::Runtime::status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendHealthView {
    pub name: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub breaker_state: String,
}

/// Everything `status()` returns.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub backends: Vec<BackendHealthView>,
    pub cache_entries: usize,
    pub total_requests: usize,
    pub total_errors: usize,
    pub total_cost_eur: Decimal,
}

/// Process-lifetime counters. Cheap to clone (wraps `Arc`-free atomics
/// behind shared references — one instance per [`crate::lifecycle::Runtime`]).
#[derive(Default)]
pub struct Observability {
    requests_by_backend_success: DashMap<(String, bool), AtomicU64>,
    errors_by_kind: DashMap<String, AtomicU64>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    total_cost_eur: Mutex<Decimal>,
    latency: Histogram,
    tokens_input: AtomicU64,
    tokens_output: AtomicU64,
    rag_queries: AtomicU64,
    rag_fallbacks: AtomicU64,
    rag_errors: AtomicU64,
}

impl Observability {
    pub fn new() -> Self {
        Self { latency: Histogram::new(), ..Default::default() }
    }

    pub fn record_request(&self, backend: &str, success: bool, latency_ms: u64) {
        self.requests_by_backend_success
            .entry((backend.to_string(), success))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.latency.observe(latency_ms);
    }

    pub fn record_error(&self, kind: &str) {
        self.errors_by_kind.entry(kind.to_string()).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_cost(&self, cost_eur: Decimal) {
        let mut total = self.total_cost_eur.lock().expect("observability cost mutex poisoned");
        *total += cost_eur;
    }

    pub fn record_tokens(&self, input: u32, output: u32) {
        self.tokens_input.fetch_add(input as u64, Ordering::Relaxed);
        self.tokens_output.fetch_add(output as u64, Ordering::Relaxed);
    }

    pub fn record_rag_query(&self) {
        self.rag_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rag_fallback(&self) {
        self.rag_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rag_error(&self) {
        self.rag_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_by_backend_success.iter().map(|e| e.value().load(Ordering::Relaxed)).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.errors_by_kind.iter().map(|e| e.value().load(Ordering::Relaxed)).sum()
    }

    pub fn total_cost_eur(&self) -> Decimal {
        *self.total_cost_eur.lock().expect("observability cost mutex poisoned")
    }

    fn breaker_state_value(state: BreakerState) -> u8 {
        match state {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }

    fn breaker_state_label(state: BreakerState) -> &'static str {
        match state {
            BreakerState::Closed => "closed",
            BreakerState::HalfOpen => "half_open",
            BreakerState::Open => "open",
        }
    }

    /// Render Prometheus text exposition format. `breakers` is per-backend
    /// current state plus cumulative transition counts (from
    /// [`crate::router::Router::breaker_snapshot`]); `cache`/`pool_active`/
    /// `pool_free` are live snapshots the caller pulls from the Cache and
    /// Pool at render time rather than counters Observability itself owns.
    pub fn render(
        &self,
        breakers: &[(String, BreakerState, Vec<((BreakerState, BreakerState), u64)>)],
        cache: Option<(usize, u64)>,
        pool_active: &HashMap<String, u64>,
        pool_free: &HashMap<String, u64>,
    ) -> String {
        let mut out = String::with_capacity(1024);

        out.push_str("# HELP claudette_requests_total Requests handled, labelled by backend and outcome.\n");
        out.push_str("# TYPE claudette_requests_total counter\n");
        let mut rows: Vec<_> = self.requests_by_backend_success.iter().map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed))).collect();
        rows.sort();
        for ((backend, success), count) in rows {
            out.push_str(&format!("claudette_requests_total{{backend=\"{backend}\",success=\"{success}\"}} {count}\n"));
        }
        out.push('\n');

        out.push_str("# HELP claudette_errors_total Errors returned, labelled by error kind.\n");
        out.push_str("# TYPE claudette_errors_total counter\n");
        let mut error_rows: Vec<_> = self.errors_by_kind.iter().map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed))).collect();
        error_rows.sort();
        for (kind, count) in error_rows {
            out.push_str(&format!("claudette_errors_total{{kind=\"{kind}\"}} {count}\n"));
        }
        out.push('\n');

        out.push_str("# HELP claudette_cache_hits_total Cache lookups, labelled by outcome.\n");
        out.push_str("# TYPE claudette_cache_hits_total counter\n");
        out.push_str(&format!("claudette_cache_hits_total{{outcome=\"hit\"}} {}\n", self.cache_hits.load(Ordering::Relaxed)));
        out.push_str(&format!("claudette_cache_hits_total{{outcome=\"miss\"}} {}\n\n", self.cache_misses.load(Ordering::Relaxed)));

        out.push_str("# HELP claudette_cost_eur_total Cumulative estimated backend cost in EUR.\n");
        out.push_str("# TYPE claudette_cost_eur_total counter\n");
        out.push_str(&format!("claudette_cost_eur_total {}\n\n", self.total_cost_eur()));

        out.push_str("# HELP claudette_latency_ms Request latency in milliseconds.\n");
        out.push_str("# TYPE claudette_latency_ms histogram\n");
        for (bound, bucket) in LATENCY_BUCKETS_MS.iter().zip(&self.latency.buckets) {
            out.push_str(&format!("claudette_latency_ms_bucket{{le=\"{bound}\"}} {}\n", bucket.load(Ordering::Relaxed)));
        }
        out.push_str(&format!("claudette_latency_ms_bucket{{le=\"+Inf\"}} {}\n", self.latency.count.load(Ordering::Relaxed)));
        out.push_str(&format!("claudette_latency_ms_sum {}\n", self.latency.sum_ms.load(Ordering::Relaxed)));
        out.push_str(&format!("claudette_latency_ms_count {}\n\n", self.latency.count.load(Ordering::Relaxed)));

        out.push_str("# HELP claudette_tokens_input_total Input tokens consumed across all backends.\n");
        out.push_str("# TYPE claudette_tokens_input_total counter\n");
        out.push_str(&format!("claudette_tokens_input_total {}\n\n", self.tokens_input.load(Ordering::Relaxed)));

        out.push_str("# HELP claudette_tokens_output_total Output tokens produced across all backends.\n");
        out.push_str("# TYPE claudette_tokens_output_total counter\n");
        out.push_str(&format!("claudette_tokens_output_total {}\n\n", self.tokens_output.load(Ordering::Relaxed)));

        if let Some((entries, size_bytes)) = cache {
            out.push_str("# HELP claudette_cache_entries Entries currently held in the hot cache tier.\n");
            out.push_str("# TYPE claudette_cache_entries gauge\n");
            out.push_str(&format!("claudette_cache_entries {entries}\n\n"));

            out.push_str("# HELP claudette_cache_size_bytes Bytes tracked against the hot cache tier's soft budget.\n");
            out.push_str("# TYPE claudette_cache_size_bytes gauge\n");
            out.push_str(&format!("claudette_cache_size_bytes {size_bytes}\n\n"));
        }

        out.push_str("# HELP claudette_breaker_state Circuit breaker state per backend (0=closed, 1=half_open, 2=open).\n");
        out.push_str("# TYPE claudette_breaker_state gauge\n");
        let mut breaker_rows: Vec<_> = breakers.iter().map(|(name, state, _)| (name.clone(), *state)).collect();
        breaker_rows.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, state) in breaker_rows {
            out.push_str(&format!("claudette_breaker_state{{backend=\"{name}\"}} {}\n", Self::breaker_state_value(state)));
        }
        out.push('\n');

        out.push_str("# HELP claudette_breaker_transitions_total Circuit breaker state transitions per backend.\n");
        out.push_str("# TYPE claudette_breaker_transitions_total counter\n");
        let mut transition_rows: Vec<_> = breakers
            .iter()
            .flat_map(|(name, _, transitions)| transitions.iter().map(move |((from, to), count)| (name.clone(), *from, *to, *count)))
            .collect();
        transition_rows.sort_by(|a, b| (a.0.as_str(), a.1 as u8, a.2 as u8).cmp(&(b.0.as_str(), b.1 as u8, b.2 as u8)));
        for (name, from, to, count) in transition_rows {
            out.push_str(&format!(
                "claudette_breaker_transitions_total{{backend=\"{name}\",from=\"{}\",to=\"{}\"}} {count}\n",
                Self::breaker_state_label(from),
                Self::breaker_state_label(to)
            ));
        }
        out.push('\n');

        out.push_str("# HELP claudette_rag_queries_total RAG enrichment attempts.\n");
        out.push_str("# TYPE claudette_rag_queries_total counter\n");
        out.push_str(&format!("claudette_rag_queries_total {}\n\n", self.rag_queries.load(Ordering::Relaxed)));

        out.push_str("# HELP claudette_rag_fallbacks_total RAG enrichments served by a non-primary provider in the fallback chain.\n");
        out.push_str("# TYPE claudette_rag_fallbacks_total counter\n");
        out.push_str(&format!("claudette_rag_fallbacks_total {}\n\n", self.rag_fallbacks.load(Ordering::Relaxed)));

        out.push_str("# HELP claudette_rag_errors_total RAG enrichments that exhausted the fallback chain without a result.\n");
        out.push_str("# TYPE claudette_rag_errors_total counter\n");
        out.push_str(&format!("claudette_rag_errors_total {}\n\n", self.rag_errors.load(Ordering::Relaxed)));

        out.push_str("# HELP claudette_pool_active_sockets In-flight HTTP requests per origin.\n");
        out.push_str("# TYPE claudette_pool_active_sockets gauge\n");
        let mut active_rows: Vec<_> = pool_active.iter().collect();
        active_rows.sort();
        for (origin, count) in active_rows {
            out.push_str(&format!("claudette_pool_active_sockets{{origin=\"{origin}\"}} {count}\n"));
        }
        out.push('\n');

        out.push_str("# HELP claudette_pool_free_sockets Idle socket capacity remaining per origin.\n");
        out.push_str("# TYPE claudette_pool_free_sockets gauge\n");
        let mut free_rows: Vec<_> = pool_free.iter().collect();
        free_rows.sort();
        for (origin, count) in free_rows {
            out.push_str(&format!("claudette_pool_free_sockets{{origin=\"{origin}\"}} {count}\n"));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_requests_split_by_backend_and_outcome() {
        let obs = Observability::new();
        obs.record_request("openai", true, 120);
        obs.record_request("openai", false, 80);
        obs.record_request("claude", true, 200);
        assert_eq!(obs.total_requests(), 3);
    }

    #[test]
    fn render_includes_all_metric_families() {
        let obs = Observability::new();
        obs.record_request("openai", true, 42);
        obs.record_error("backend_timeout");
        obs.record_cache(true);
        obs.add_cost(Decimal::new(15, 4));

        obs.record_tokens(12, 34);
        obs.record_rag_query();
        obs.record_rag_fallback();
        obs.record_rag_error();

        let text = obs.render(&[], Some((3, 4096)), &HashMap::new(), &HashMap::new());
        assert!(text.contains("claudette_requests_total"));
        assert!(text.contains("claudette_errors_total"));
        assert!(text.contains("claudette_cache_hits_total"));
        assert!(text.contains("claudette_cost_eur_total"));
        assert!(text.contains("claudette_latency_ms_bucket"));
        assert!(text.contains("claudette_tokens_input_total 12"));
        assert!(text.contains("claudette_tokens_output_total 34"));
        assert!(text.contains("claudette_cache_entries 3"));
        assert!(text.contains("claudette_cache_size_bytes 4096"));
        assert!(text.contains("claudette_rag_queries_total 1"));
        assert!(text.contains("claudette_rag_fallbacks_total 1"));
        assert!(text.contains("claudette_rag_errors_total 1"));
    }

    #[test]
    fn render_includes_breaker_and_pool_gauges() {
        let obs = Observability::new();
        let breakers = vec![(
            "openai".to_string(),
            crate::breaker::BreakerState::Open,
            vec![((crate::breaker::BreakerState::Closed, crate::breaker::BreakerState::Open), 2)],
        )];
        let mut active = HashMap::new();
        active.insert("https://api.openai.com".to_string(), 3u64);
        let mut free = HashMap::new();
        free.insert("https://api.openai.com".to_string(), 7u64);

        let text = obs.render(&breakers, None, &active, &free);
        assert!(text.contains("claudette_breaker_state{backend=\"openai\"} 2"));
        assert!(text.contains("claudette_breaker_transitions_total{backend=\"openai\",from=\"closed\",to=\"open\"} 2"));
        assert!(text.contains("claudette_pool_active_sockets{origin=\"https://api.openai.com\"} 3"));
        assert!(text.contains("claudette_pool_free_sockets{origin=\"https://api.openai.com\"} 7"));
    }

    #[test]
    fn latency_histogram_places_observation_in_every_bucket_at_or_above_it() {
        let obs = Observability::new();
        obs.record_request("openai", true, 60);
        let text = obs.render(&[], None, &HashMap::new(), &HashMap::new());
        assert!(text.contains("claudette_latency_ms_bucket{le=\"50\"} 0"));
        assert!(text.contains("claudette_latency_ms_bucket{le=\"100\"} 1"));
    }

    #[test]
    fn cost_accumulates_across_calls() {
        let obs = Observability::new();
        obs.add_cost(Decimal::new(1, 2));
        obs.add_cost(Decimal::new(2, 2));
        assert_eq!(obs.total_cost_eur(), Decimal::new(3, 2));
    }
}

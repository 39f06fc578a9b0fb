//! Adaptive backend router.
//!
//! A state struct holding a live config snapshot and dispatching against a
//! backend table, using scored selection against cost, latency, and
//! availability plus a bounded-attempt fallback loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rust_decimal::Decimal;

use crate::backends::{tokenizer, AdapterOutcome, BackendAdapter, BackendClient};
use crate::breaker::{Breaker, BreakerState, RetryStrategy};
use crate::config::{Config, RouterWeights};
use crate::error::ClaudetteError;
use crate::health::HealthTable;
use crate::model::{FailureKind, Request};
use crate::pool::Pool;

const REFERENCE_COST_EUR: f64 = 0.01;
const REFERENCE_LATENCY_MS: f64 = 10_000.0;
const DEFAULT_LATENCY_ESTIMATE_MS: u64 = 400;
const DEFAULT_ESTIMATED_OUTPUT_TOKENS: u32 = 512;
const MAX_EXPONENTIAL_BACKOFF: Duration = Duration::from_secs(30);

struct BackendEntry {
    client: Arc<BackendClient>,
    breaker: Arc<Breaker>,
    priority: i32,
    /// Whether `validate_config()` found no missing-`api_key` issue at
    /// construction time — `anthropic_claude` already fails `Router::new`
    /// outright without a key (see `BackendClient::new`), but OpenAI/Qwen
    /// accept a missing key at construction and only fail per-request.
    key_resolved: bool,
}

/// What a successful or exhausted routing attempt produced.
#[derive(Debug)]
pub struct RouteOutcome {
    pub backend: String,
    pub outcome: AdapterOutcome,
    pub latency_ms: u64,
}

pub struct Router {
    entries: HashMap<String, BackendEntry>,
    /// Backend names in a stable order, used both for iteration and as the
    /// "registration order" tie-break. Config stores backends in a
    /// `HashMap`, so this is lexical order rather than declaration order —
    /// see DESIGN.md for why that trade-off was accepted.
    order: Vec<String>,
    health: HealthTable,
    pool: Pool,
    weights: RouterWeights,
    max_attempts: u32,
    forced_backend: Option<String>,
}

impl Router {
    pub fn new(config: &Config, pool: Pool, health: HealthTable) -> Result<Self, ClaudetteError> {
        let mut order: Vec<String> = config.backends.keys().cloned().collect();
        order.sort();

        let mut entries = HashMap::new();
        for name in &order {
            let cfg = &config.backends[name];
            if !cfg.enabled {
                continue;
            }
            let mut effective = cfg.clone();
            if effective.api_key.is_none() {
                effective.api_key = config.resolve_api_key(name);
            }
            let client = Arc::new(BackendClient::from_config(name, &effective)?);
            let key_resolved = !client.validate_config().iter().any(|issue| issue.field == "api_key");
            health.register(name);
            entries.insert(name.clone(), BackendEntry { client, breaker: Arc::new(Breaker::new()), priority: cfg.priority, key_resolved });
        }
        order.retain(|name| entries.contains_key(name));

        Ok(Self {
            entries,
            order,
            health,
            pool,
            weights: config.router.weights,
            max_attempts: config.router.max_attempts.max(1),
            forced_backend: config.router.forced_backend.clone(),
        })
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn breaker_state(&self, name: &str) -> Option<BreakerState> {
        self.entries.get(name).map(|e| e.breaker.state())
    }

    /// Backend clients keyed by name, for wiring up [`crate::health::HealthMonitor`].
    pub fn backend_clients(&self) -> HashMap<String, Arc<BackendClient>> {
        self.entries.iter().map(|(name, entry)| (name.clone(), Arc::clone(&entry.client))).collect()
    }

    pub fn estimate_cost(&self, backend: &str, tokens_input: u32, tokens_output: u32) -> Option<Decimal> {
        self.entries.get(backend).map(|e| e.client.estimate_cost(tokens_input, tokens_output))
    }

    fn is_usable(&self, name: &str, entry: &BackendEntry) -> bool {
        let breaker_ok = !matches!(entry.breaker.state(), BreakerState::Open);
        let health_ok = self.health.get(name).map(|h| h.healthy).unwrap_or(true);
        if self.health.is_stale(name) {
            self.refresh_stale(name, entry);
        }
        breaker_ok && health_ok && entry.key_resolved
    }

    /// Fire an out-of-band probe for a stale health record without blocking
    /// the caller's own routing decision — the next request sees the
    /// refreshed record once it lands.
    fn refresh_stale(&self, name: &str, entry: &BackendEntry) {
        let name = name.to_string();
        let client = Arc::clone(&entry.client);
        let pool = self.pool.clone();
        let health = self.health.clone();
        tokio::spawn(async move {
            if let Ok(probe) = client.probe_health(&pool).await {
                health.record_probe(&name, probe.healthy, probe.latency_ms);
            }
        });
    }

    /// Per-backend breaker state plus cumulative transition counts, for the
    /// `breaker_state`/`breaker_transitions_total` metrics.
    pub fn breaker_snapshot(&self) -> Vec<(String, BreakerState, Vec<((BreakerState, BreakerState), u64)>)> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name).map(|e| (name.clone(), e.breaker.state(), e.breaker.transition_counts())))
            .collect()
    }

    /// `S = w_c·C + w_l·L + w_a·A`. Lower wins.
    fn score(&self, name: &str, entry: &BackendEntry, request: &Request) -> f64 {
        let est_input = tokenizer::estimate_tokens(&request.prompt);
        let est_output = request.options.max_tokens.unwrap_or(DEFAULT_ESTIMATED_OUTPUT_TOKENS);
        let cost: f64 = entry.client.estimate_cost(est_input, est_output).to_string().parse().unwrap_or(0.0);
        let c = (cost / REFERENCE_COST_EUR).min(1.0);

        let latency_ms = self.health.get(name).map(|h| h.latency_ms).unwrap_or(DEFAULT_LATENCY_ESTIMATE_MS) as f64;
        let l = (latency_ms / REFERENCE_LATENCY_MS).min(1.0);

        let mut a = (entry.breaker.failure_count() as f64 / 10.0).min(1.0);
        if let Some(since) = entry.breaker.since_last_failure() {
            let since_ms = since.as_millis() as f64;
            if since_ms > 60_000.0 {
                a *= (1.0 - since_ms / 3_600_000.0).max(0.1);
            }
        }

        self.weights.cost * c + self.weights.latency * l + self.weights.availability * a
    }

    fn select_best(&self, request: &Request, excluded: &HashSet<String>) -> Option<String> {
        self.order
            .iter()
            .filter(|name| !excluded.contains(*name))
            .filter_map(|name| self.entries.get(name).map(|e| (name, e)))
            .filter(|(name, entry)| self.is_usable(name, entry))
            .map(|(name, entry)| (name.clone(), self.score(name, entry, request), entry.priority))
            .fold(None, |best: Option<(String, f64, i32)>, candidate| match best {
                None => Some(candidate),
                Some(b) => {
                    if candidate.1 < b.1 || ((candidate.1 - b.1).abs() < f64::EPSILON && candidate.2 < b.2) {
                        Some(candidate)
                    } else {
                        Some(b)
                    }
                }
            })
            .map(|(name, _, _)| name)
    }

    /// Dispatch `request`, honoring `options.timeoutMs` as a hard ceiling
    /// across every attempt.
    pub async fn route(&self, request: &Request) -> Result<RouteOutcome, ClaudetteError> {
        match tokio::time::timeout(request.options.timeout(), self.route_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(ClaudetteError::cancelled()),
        }
    }

    async fn route_inner(&self, request: &Request) -> Result<RouteOutcome, ClaudetteError> {
        // A per-request pin takes precedence over the config-level override;
        // the override only decides what happens absent a more specific ask.
        match request.options.backend.as_deref().or(self.forced_backend.as_deref()) {
            Some(forced) => self.route_forced(forced, request).await,
            None => self.route_adaptive(request).await,
        }
    }

    /// A pinned backend disables fallback to another backend entirely. A
    /// single retry against the *same* backend is permitted, but only when
    /// the failure was a retryable transport error (connection/timeout).
    async fn route_forced(&self, name: &str, request: &Request) -> Result<RouteOutcome, ClaudetteError> {
        let entry = self.entries.get(name).ok_or_else(|| ClaudetteError::no_backend().with_backend(name.to_string()))?;
        if !self.is_usable(name, entry) {
            return Err(ClaudetteError::no_backend().with_backend(name.to_string()));
        }
        entry.breaker.admit().map_err(|_| ClaudetteError::no_backend().with_backend(name.to_string()))?;

        let attempt = self.call(name, entry, request).await;
        let err = match attempt {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };

        let kind = err.failure_kind.unwrap_or(FailureKind::Other);
        if !matches!(kind, FailureKind::Connection | FailureKind::Timeout) {
            return Err(err);
        }
        entry.breaker.admit().map_err(|_| err)?;
        self.call(name, entry, request).await
    }

    async fn route_adaptive(&self, request: &Request) -> Result<RouteOutcome, ClaudetteError> {
        let mut excluded = HashSet::new();
        let mut last_err: Option<ClaudetteError> = None;

        for attempt in 1..=self.max_attempts {
            let Some(name) = self.select_best(request, &excluded) else {
                return Err(last_err.unwrap_or_else(ClaudetteError::no_backend));
            };
            let entry = self.entries.get(&name).expect("selected backend must be present in the table");

            if let Err(strategy) = entry.breaker.admit() {
                excluded.insert(name);
                sleep_for(wait_for(strategy, attempt)).await;
                continue;
            }

            match self.call(&name, entry, request).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    let kind = err.failure_kind.unwrap_or(FailureKind::Other);
                    let strategy = entry.breaker.record_failure(kind);
                    excluded.insert(name);
                    if !kind.retryable() {
                        return Err(err);
                    }
                    let wait = wait_for(strategy, attempt);
                    last_err = Some(err);
                    sleep_for(wait).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(ClaudetteError::no_backend))
    }

    async fn call(&self, name: &str, entry: &BackendEntry, request: &Request) -> Result<RouteOutcome, ClaudetteError> {
        let started = Instant::now();
        match entry.client.send(request, &self.pool).await {
            Ok(outcome) => {
                entry.breaker.record_success();
                Ok(RouteOutcome { backend: name.to_string(), outcome, latency_ms: started.elapsed().as_millis() as u64 })
            }
            Err(err) => Err(err),
        }
    }

    #[cfg(test)]
    fn for_test(entries: Vec<(&str, Arc<BackendClient>, i32)>, pool: Pool, health: HealthTable, weights: RouterWeights, max_attempts: u32) -> Self {
        let mut order = Vec::new();
        let mut map = HashMap::new();
        for (name, client, priority) in entries {
            order.push(name.to_string());
            health.register(name);
            map.insert(name.to_string(), BackendEntry { client, breaker: Arc::new(Breaker::new()), priority, key_resolved: true });
        }
        Self { entries: map, order, health, pool, weights, max_attempts, forced_backend: None }
    }
}

async fn sleep_for(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

fn wait_for(strategy: RetryStrategy, attempt: u32) -> Duration {
    let base = match strategy {
        RetryStrategy::ImmediateRetry | RetryStrategy::CircuitOpen => Duration::ZERO,
        RetryStrategy::LinearBackoff => Duration::from_millis(250u64.saturating_mul(attempt as u64)),
        RetryStrategy::ExponentialBackoff => {
            let ms = 500u64.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
            Duration::from_millis(ms).min(MAX_EXPONENTIAL_BACKOFF)
        }
    };
    jitter(base)
}

/// ±15% jitter around `base`.
fn jitter(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let ms = base.as_millis() as i64;
    let spread = (ms as f64 * 0.15) as i64;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((ms + offset).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::OllamaAdapter;
    use crate::model::{BackendDescriptor, BackendKind, RequestOptions};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor(name: &str, base_url: String, cost: Decimal) -> BackendDescriptor {
        BackendDescriptor {
            name: name.into(),
            kind: BackendKind::OllamaLocal,
            enabled: true,
            priority: 0,
            base_url,
            api_key: None,
            model: "qwen2.5:7b".into(),
            max_tokens: 512,
            temperature: 0.7,
            cost_per_k_token: cost,
            health_path: None,
            timeout_ms: 5_000,
        }
    }

    fn equal_weights() -> RouterWeights {
        RouterWeights { cost: 1.0 / 3.0, latency: 1.0 / 3.0, availability: 1.0 / 3.0 }
    }

    async fn mock_backend(content: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "qwen2.5:7b",
                "choices": [{"message": {"content": content}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn cheaper_backend_wins_with_equal_health() {
        let cheap_server = mock_backend("from cheap").await;
        let pricey_server = mock_backend("from pricey").await;

        let cheap = Arc::new(BackendClient::new(&descriptor("cheap", cheap_server.uri(), Decimal::ZERO)).unwrap());
        let pricey = Arc::new(BackendClient::new(&descriptor("pricey", pricey_server.uri(), Decimal::new(1, 0))).unwrap());

        let router = Router::for_test(vec![("cheap", cheap, 0), ("pricey", pricey, 0)], Pool::new(), HealthTable::new(), equal_weights(), 3);

        let outcome = router.route(&Request::new("hi")).await.unwrap();
        assert_eq!(outcome.backend, "cheap");
    }

    #[tokio::test]
    async fn forced_backend_is_required_even_if_not_cheapest() {
        let cheap_server = mock_backend("from cheap").await;
        let pricey_server = mock_backend("from pricey").await;

        let cheap = Arc::new(BackendClient::new(&descriptor("cheap", cheap_server.uri(), Decimal::ZERO)).unwrap());
        let pricey = Arc::new(BackendClient::new(&descriptor("pricey", pricey_server.uri(), Decimal::new(1, 0))).unwrap());

        let router = Router::for_test(vec![("cheap", cheap, 0), ("pricey", pricey, 0)], Pool::new(), HealthTable::new(), equal_weights(), 3);

        let request = Request::new("hi").with_options(RequestOptions { backend: Some("pricey".to_string()), ..Default::default() });
        let outcome = router.route(&request).await.unwrap();
        assert_eq!(outcome.backend, "pricey");
    }

    #[tokio::test]
    async fn forced_backend_fails_immediately_on_non_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/v1/chat/completions")).respond_with(ResponseTemplate::new(401)).mount(&server).await;

        let auth_failing = Arc::new(BackendClient::new(&descriptor("flaky", server.uri(), Decimal::ZERO)).unwrap());
        let router = Router::for_test(vec![("flaky", auth_failing, 0)], Pool::new(), HealthTable::new(), equal_weights(), 3);

        let request = Request::new("hi").with_options(RequestOptions { backend: Some("flaky".to_string()), ..Default::default() });
        let err = router.route(&request).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::BackendAuth);
    }

    #[tokio::test]
    async fn adaptive_routing_falls_back_after_retryable_failure() {
        let failing_server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/v1/chat/completions")).respond_with(ResponseTemplate::new(503)).mount(&failing_server).await;
        let healthy_server = mock_backend("recovered").await;

        let failing = Arc::new(BackendClient::new(&descriptor("failing", failing_server.uri(), Decimal::ZERO)).unwrap());
        let healthy = Arc::new(BackendClient::new(&descriptor("healthy", healthy_server.uri(), Decimal::new(1, 0))).unwrap());

        // `failing` is cheaper so it would be selected first; it must fail
        // over to `healthy` rather than exhausting attempts.
        let router = Router::for_test(vec![("failing", failing, 0), ("healthy", healthy, 0)], Pool::new(), HealthTable::new(), equal_weights(), 3);

        let outcome = router.route(&Request::new("hi")).await.unwrap();
        assert_eq!(outcome.backend, "healthy");
    }

    #[test]
    fn wait_for_immediate_retry_is_always_zero() {
        assert_eq!(wait_for(RetryStrategy::ImmediateRetry, 1), Duration::ZERO);
    }

    #[test]
    fn wait_for_exponential_backoff_caps_at_thirty_seconds() {
        assert!(wait_for(RetryStrategy::ExponentialBackoff, 10) <= MAX_EXPONENTIAL_BACKOFF);
    }

    #[tokio::test]
    async fn config_forced_backend_overrides_adaptive_selection() {
        let cheap_server = mock_backend("from cheap").await;
        let pricey_server = mock_backend("from pricey").await;

        let toml_src = format!(
            r#"
            [backends.cheap]
            provider = "ollama_local"
            base_url = "{}"
            cost_per_k_token = "0"

            [backends.pricey]
            provider = "ollama_local"
            base_url = "{}"
            cost_per_k_token = "1"

            [router]
            forced_backend = "pricey"
            "#,
            cheap_server.uri(),
            pricey_server.uri()
        );
        let config: Config = toml::from_str(&toml_src).unwrap();
        let router = Router::new(&config, Pool::new(), HealthTable::new()).unwrap();

        let outcome = router.route(&Request::new("hi")).await.unwrap();
        assert_eq!(outcome.backend, "pricey");
    }

    #[tokio::test]
    async fn request_pin_overrides_config_forced_backend() {
        let cheap_server = mock_backend("from cheap").await;
        let pricey_server = mock_backend("from pricey").await;

        let toml_src = format!(
            r#"
            [backends.cheap]
            provider = "ollama_local"
            base_url = "{}"
            cost_per_k_token = "0"

            [backends.pricey]
            provider = "ollama_local"
            base_url = "{}"
            cost_per_k_token = "1"

            [router]
            forced_backend = "pricey"
            "#,
            cheap_server.uri(),
            pricey_server.uri()
        );
        let config: Config = toml::from_str(&toml_src).unwrap();
        let router = Router::new(&config, Pool::new(), HealthTable::new()).unwrap();

        let request = Request::new("hi").with_options(RequestOptions { backend: Some("cheap".to_string()), ..Default::default() });
        let outcome = router.route(&request).await.unwrap();
        assert_eq!(outcome.backend, "cheap");
    }

    #[test]
    fn unresolved_api_key_excludes_backend_from_selection() {
        let descriptor = BackendDescriptor {
            name: "openai".into(),
            kind: BackendKind::OpenAi,
            enabled: true,
            priority: 0,
            base_url: "https://api.openai.com".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            max_tokens: 512,
            temperature: 0.7,
            cost_per_k_token: Decimal::ZERO,
            health_path: None,
            timeout_ms: 5_000,
        };
        let client = Arc::new(BackendClient::new(&descriptor).unwrap());
        let router = Router::for_test(vec![("openai", client, 0)], Pool::new(), HealthTable::new(), equal_weights(), 3);
        let entry = BackendEntry {
            client: Arc::clone(&router.entries["openai"].client),
            breaker: Arc::clone(&router.entries["openai"].breaker),
            priority: 0,
            key_resolved: false,
        };
        assert!(!router.is_usable("openai", &entry));
    }

    #[test]
    fn ollama_adapter_import_is_exercised_via_backend_client() {
        // Keeps the otherwise-unused direct import honest — construction
        // goes through `BackendClient::new`, never `OllamaAdapter` directly,
        // in the tests above.
        let _ = std::marker::PhantomData::<OllamaAdapter>;
    }
}

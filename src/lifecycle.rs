//! Lifecycle Controller: single-flight startup, the `optimize` request
//! pipeline, and graceful shutdown.
//!
//! `Runtime::initialize` reuses the `Arc<RwLock<Arc<Config>>>` snapshot
//! idiom that config hot-reload would use, but applies it to startup
//! instead of reload: a `tokio::sync::OnceCell` makes concurrent callers
//! share one in-flight construction rather than racing to build the
//! backend table and connection pool twice.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rust_decimal::Decimal;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::cache::{fingerprint, Cache};
use crate::config::{Config, ValidationReport};
use crate::error::{ClaudetteError, ErrorKind};
use crate::health::{HealthMonitor, HealthTable};
use crate::model::{FileRef, RagStatus, Request, RequestOptions, Response, ResponseMetadata};
use crate::observability::{BackendHealthView, HealthSnapshot, Observability};
use crate::pool::Pool;
use crate::rag::{self, RagEnhancement, RagRegistry, StaticRagProvider};
use crate::router::Router;
use crate::traffic::{TrafficEntry, TrafficLog};

static RUNTIME: OnceCell<Arc<Runtime>> = OnceCell::const_new();

/// Everything one running Claudette instance owns.
pub struct Runtime {
    config: Config,
    router: Router,
    cache: Option<Arc<Cache>>,
    rag_registry: RagRegistry,
    health: HealthTable,
    health_monitor: Arc<HealthMonitor>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
    compaction_handle: Mutex<Option<JoinHandle<()>>>,
    traffic: Arc<TrafficLog>,
    observability: Observability,
    pool: Pool,
    shutting_down: AtomicBool,
}

impl Runtime {
    /// Load, validate, and wire up a runtime from the config file at
    /// `config_path`. Concurrent callers share one construction.
    pub async fn initialize(config_path: &Path) -> Result<Arc<Runtime>, ClaudetteError> {
        let path = config_path.to_path_buf();
        let runtime = RUNTIME.get_or_try_init(|| async move { Self::build(&path).map(Arc::new) }).await?;
        Ok(Arc::clone(runtime))
    }

    fn build(config_path: &Path) -> Result<Self, ClaudetteError> {
        let config = Config::load(config_path).map_err(|e| ClaudetteError::config_invalid(e.to_string()))?;

        let pool = Pool::new();
        let health = HealthTable::new();
        let router = Router::new(&config, pool.clone(), health.clone())?;
        let health_monitor = Arc::new(HealthMonitor::new(health.clone()));

        let cache = if config.features.caching {
            let data_dir = Path::new(&config.gateway.data_dir);
            match Cache::new(data_dir, config.thresholds.max_cache_entries, config.thresholds.cache_ttl_seconds) {
                Ok(cache) => Some(Arc::new(cache)),
                Err(err) => {
                    tracing::warn!(error = %err, "cold cache unavailable, falling back to in-memory only");
                    Some(Arc::new(Cache::in_memory(config.thresholds.max_cache_entries, config.thresholds.cache_ttl_seconds)))
                }
            }
        } else {
            None
        };

        let rag_registry = build_rag_registry(&config);

        let traffic = Arc::new(TrafficLog::new(config.gateway.traffic_log_capacity));

        Ok(Self {
            config,
            router,
            cache,
            rag_registry,
            health,
            health_monitor,
            health_handle: Mutex::new(None),
            compaction_handle: Mutex::new(None),
            traffic,
            observability: Observability::new(),
            pool,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Start the background health-probe loop and cold-cache compaction.
    /// Split from [`Self::build`] so construction stays synchronous and
    /// testable without `tokio::spawn`ing anything.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let backends = self.router.backend_clients();
        let handle = Arc::clone(&self.health_monitor).spawn(backends, self.pool.clone());
        *self.health_handle.lock().expect("health handle mutex poisoned") = Some(handle);

        if let Some(cache) = &self.cache {
            let handle = cache.spawn_compaction();
            *self.compaction_handle.lock().expect("compaction handle mutex poisoned") = Some(handle);
        }
    }

    /// Lifecycle gate → RAG enrichment → cache lookup → router dispatch →
    /// cost accounting → cache store → observability update.
    pub async fn optimize(&self, prompt: impl Into<String>, files: Vec<FileRef>, options: RequestOptions) -> Result<Response, ClaudetteError> {
        let request = Request { prompt: prompt.into(), files, options };
        self.optimize_request(&request).await
    }

    pub async fn optimize_request(&self, request: &Request) -> Result<Response, ClaudetteError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ClaudetteError::cancelled());
        }
        match tokio::time::timeout(request.options.timeout(), self.optimize_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(ClaudetteError::cancelled()),
        }
    }

    async fn optimize_inner(&self, request: &Request) -> Result<Response, ClaudetteError> {
        let enhanced = match rag::enhance(request, &self.rag_registry, &self.config.rag.fallback_chain).await {
            Ok(enhanced) => {
                self.record_rag_outcome(&enhanced);
                enhanced
            }
            Err(err) => {
                self.observability.record_rag_query();
                self.observability.record_rag_error();
                return Err(err);
            }
        };
        let mut effective = request.clone();
        effective.prompt = enhanced.prompt.clone();

        let caching_enabled = self.config.features.caching && !request.options.bypass_cache;
        let fingerprint = if caching_enabled { Some(fingerprint::compute(&effective)) } else { None };

        let Some(cache) = self.cache.as_ref().filter(|_| caching_enabled) else {
            return self.dispatch(&effective, &enhanced).await;
        };
        let fp = fingerprint.expect("fingerprint computed whenever caching is enabled");

        if let Some(response) = cache.get(&fp).await {
            self.observability.record_cache(true);
            return Ok(self.finish_cached(response, &enhanced, false));
        }
        self.observability.record_cache(false);

        let (won, notify) = cache.begin_single_flight(&fp);
        if !won {
            notify.notified().await;
            if let Some(response) = cache.get(&fp).await {
                return Ok(self.finish_cached(response, &enhanced, true));
            }
            // The winner's call failed; fall through and issue our own.
        }

        let result = self.dispatch(&effective, &enhanced).await;
        if let Ok(response) = &result {
            cache.set(fp.clone(), response.clone()).await;
        }
        cache.end_single_flight(&fp);
        result
    }

    fn record_rag_outcome(&self, enhanced: &RagEnhancement) {
        if enhanced.status == RagStatus::NotRequested {
            return;
        }
        self.observability.record_rag_query();
        if enhanced.fallback_used {
            self.observability.record_rag_fallback();
        }
        if enhanced.status == RagStatus::Error {
            self.observability.record_rag_error();
        }
    }

    fn finish_cached(&self, mut response: Response, enhanced: &RagEnhancement, coalesced: bool) -> Response {
        response.cache_hit = true;
        response.cost_eur = Decimal::ZERO;
        response.metadata.rag_status = Some(enhanced.status);
        response.metadata.rag_sources = enhanced.sources.clone();
        response.metadata.coalesced = coalesced;
        self.observability.record_request(&response.backend_used, true, response.latency_ms);
        self.traffic.push(TrafficEntry::new(response.backend_used.clone(), response.latency_ms, Decimal::ZERO, true).mark_cache_hit());
        response
    }

    async fn dispatch(&self, request: &Request, enhanced: &RagEnhancement) -> Result<Response, ClaudetteError> {
        let started = Instant::now();
        match self.router.route(request).await {
            Ok(outcome) => {
                let cost = self
                    .router
                    .estimate_cost(&outcome.backend, outcome.outcome.tokens_input, outcome.outcome.tokens_output)
                    .unwrap_or(Decimal::ZERO);
                let response = Response {
                    content: outcome.outcome.content,
                    backend_used: outcome.backend.clone(),
                    tokens_input: outcome.outcome.tokens_input,
                    tokens_output: outcome.outcome.tokens_output,
                    cost_eur: cost,
                    latency_ms: outcome.latency_ms,
                    cache_hit: false,
                    metadata: ResponseMetadata {
                        model: Some(outcome.outcome.model),
                        finish_reason: outcome.outcome.finish_reason,
                        token_source: Some(outcome.outcome.token_source),
                        rag_sources: enhanced.sources.clone(),
                        rag_status: Some(enhanced.status),
                        routing_decision: Some(outcome.backend),
                        coalesced: false,
                    },
                };
                self.observability.record_request(&response.backend_used, true, response.latency_ms);
                self.observability.record_tokens(response.tokens_input, response.tokens_output);
                self.observability.add_cost(response.cost_eur);
                self.traffic.push(TrafficEntry::new(response.backend_used.clone(), response.latency_ms, response.cost_eur, true));
                Ok(response)
            }
            Err(err) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.observability.record_error(&error_kind_label(err.kind));
                self.traffic.push(TrafficEntry::new(err.backend.clone().unwrap_or_else(|| "none".into()), elapsed, Decimal::ZERO, false).with_error(&err.message));
                Err(err)
            }
        }
    }

    pub fn status(&self) -> HealthSnapshot {
        let backends = self
            .router
            .backend_names()
            .into_iter()
            .map(|name| {
                let health = self.health.get(&name);
                BackendHealthView {
                    healthy: health.as_ref().map(|h| h.healthy).unwrap_or(false),
                    latency_ms: health.map(|h| h.latency_ms).unwrap_or(0),
                    breaker_state: self.router.breaker_state(&name).map(|s| format!("{s:?}").to_lowercase()).unwrap_or_else(|| "unknown".into()),
                    name,
                }
            })
            .collect();

        HealthSnapshot {
            backends,
            cache_entries: self.cache.as_ref().map(|c| c.len()).unwrap_or(0),
            total_requests: self.observability.total_requests() as usize,
            total_errors: self.observability.total_errors() as usize,
            total_cost_eur: self.observability.total_cost_eur(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolved admin bearer token, if `[gateway].admin_token_env` names a
    /// set environment variable. `None` disables admin auth.
    pub fn admin_token(&self) -> Option<String> {
        self.config.gateway.admin_token_env.as_ref().and_then(|var| std::env::var(var).ok())
    }

    pub fn validate_config(&self) -> ValidationReport {
        self.config.validate()
    }

    pub fn metrics(&self) -> String {
        let breakers = self.router.breaker_snapshot();
        let cache = self.cache.as_ref().map(|c| (c.len(), c.size_bytes()));
        let pool_active = self.pool.gauges();
        let pool_free = self.pool.free_gauges();
        self.observability.render(&breakers, cache, &pool_active, &pool_free)
    }

    pub fn traffic(&self) -> &TrafficLog {
        &self.traffic
    }

    /// Stop accepting new work, halt the health monitor, and drain the
    /// connection pool. Idempotent.
    pub async fn cleanup(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.health_monitor.stop();
        if let Some(handle) = self.health_handle.lock().expect("health handle mutex poisoned").take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        }
        if let Some(handle) = self.compaction_handle.lock().expect("compaction handle mutex poisoned").take() {
            handle.abort();
        }
        self.pool.shutdown();
        tokio::time::sleep(self.pool.shutdown_drain()).await;
    }
}

fn error_kind_label(kind: ErrorKind) -> String {
    serde_json::to_value(kind).ok().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_else(|| "unknown".into())
}

#[derive(serde::Deserialize)]
struct StaticProviderConfig {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    results: Vec<crate::model::RagResult>,
    #[serde(default)]
    strategy_source: StrategySourceConfig,
}

#[derive(serde::Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum StrategySourceConfig {
    #[default]
    Vector,
    Graph,
    Hybrid,
}

impl From<StrategySourceConfig> for crate::model::StrategySource {
    fn from(value: StrategySourceConfig) -> Self {
        match value {
            StrategySourceConfig::Vector => Self::Vector,
            StrategySourceConfig::Graph => Self::Graph,
            StrategySourceConfig::Hybrid => Self::Hybrid,
        }
    }
}

fn build_rag_registry(config: &Config) -> RagRegistry {
    let mut registry = RagRegistry::new();
    for (name, raw) in &config.rag.providers {
        match raw.clone().try_into::<StaticProviderConfig>() {
            Ok(parsed) if parsed.kind == "static" => {
                registry.register(Arc::new(StaticRagProvider::new(name.clone(), parsed.results, parsed.strategy_source.into())));
            }
            Ok(_) => tracing::warn!(provider = %name, "unsupported rag provider kind; skipping"),
            Err(err) => tracing::warn!(provider = %name, error = %err, "failed to parse rag provider config"),
        }
    }
    registry
}

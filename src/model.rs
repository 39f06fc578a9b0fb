//! Core data model: requests, responses, backend descriptors, and the
//! smaller value types shared across the router, cache, breaker, and RAG
//! orchestrator.
//!
//! These types are intentionally plain — no behavior beyond construction
//! helpers and `Display`/`Serialize` impls. Component-specific logic
//! (scoring, eviction, state transitions) lives in the owning module.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A generation request. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub prompt: String,
    #[serde(default)]
    pub files: Vec<FileRef>,
    #[serde(default)]
    pub options: RequestOptions,
}

impl Request {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            files: Vec::new(),
            options: RequestOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_files(mut self, files: Vec<FileRef>) -> Self {
        self.files = files;
        self
    }
}

/// A file attached to a request for context. Content is hashed for the
/// cache fingerprint rather than embedded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    pub content: String,
}

/// How retrieved RAG context is merged into the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    #[default]
    Prepend,
    Append,
    Inject,
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prepend => "prepend",
            Self::Append => "append",
            Self::Inject => "inject",
        })
    }
}

/// Per-request overrides and feature toggles.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestOptions {
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub bypass_cache: bool,
    #[serde(default)]
    pub use_rag: bool,
    /// `true` means a RAG failure degrades gracefully; `strict` mode
    /// (signalled by setting this and `use_rag`) surfaces `rag_unavailable`
    /// instead — see [`Self::rag_strict`].
    #[serde(default)]
    pub rag_strict: bool,
    #[serde(default)]
    pub rag_query: Option<String>,
    #[serde(default)]
    pub rag_provider: Option<String>,
    #[serde(default)]
    pub context_strategy: ContextStrategy,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RequestOptions {
    /// Deadline for a single `optimize` call, defaulting to 60 s.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(60_000))
    }
}

/// Where a response's token counts came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    Reported,
    Estimated,
}

/// Outcome of a RAG enhancement attempt, surfaced in response metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RagStatus {
    NotRequested,
    Ok,
    Error,
}

/// Response metadata — everything that isn't content, cost, or timing.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResponseMetadata {
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub token_source: Option<TokenSource>,
    #[serde(default)]
    pub rag_sources: Vec<String>,
    pub rag_status: Option<RagStatus>,
    pub routing_decision: Option<String>,
    /// Set when this response was served to a waiter coalesced onto an
    /// in-flight single-flight call rather than issuing its own.
    #[serde(default)]
    pub coalesced: bool,
}

/// A completed (or cached) generation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    pub backend_used: String,
    pub tokens_input: u32,
    pub tokens_output: u32,
    pub cost_eur: Decimal,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub metadata: ResponseMetadata,
}

/// Which wire protocol a backend speaks. Closed set: new providers are new
/// variants, not open inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    OpenAi,
    AnthropicClaude,
    /// OpenAI-wire-compatible protocol used by Qwen-hosted gateways. A
    /// backend configured with `provider = "flexcon"` is accepted as a
    /// configuration alias for this variant (see DESIGN.md).
    QwenCompatible,
    OllamaLocal,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::AnthropicClaude => "anthropic_claude",
            Self::QwenCompatible => "qwen_compatible",
            Self::OllamaLocal => "ollama_local",
        })
    }
}

/// Static configuration of one backend, as validated from `[backends.<name>]`.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: BackendKind,
    pub enabled: bool,
    pub priority: i32,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub cost_per_k_token: Decimal,
    pub health_path: Option<String>,
    pub timeout_ms: u64,
}

/// A single failure observation, retained in each backend's sliding
/// window (last 20 per backend — see [`crate::breaker::FAILURE_WINDOW`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connection,
    RateLimit,
    Auth,
    ServerError,
    ClientError,
    Other,
}

impl FailureKind {
    /// Whether the router should attempt another backend after this kind.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimit | Self::Connection | Self::ServerError
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FailureRecord {
    pub at: Instant,
    pub kind: FailureKind,
}

/// Liveness data for one backend. Lives only in memory.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub healthy: bool,
    pub latency_ms: u64,
    pub last_probe: Instant,
    pub failure_streak: u32,
}

impl HealthRecord {
    /// Optimistic placeholder used between registration and the first
    /// completed probe.
    pub fn optimistic_placeholder(p50_estimate_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: p50_estimate_ms,
            last_probe: Instant::now(),
            failure_streak: 0,
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.last_probe.elapsed() >= ttl
    }
}

/// One retrieved context snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagResult {
    pub content: String,
    pub score: f32,
    pub source: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Which retrieval strategy produced a [`RagContextResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySource {
    Vector,
    Graph,
    Hybrid,
}

/// Result of one RAG provider query. Transient — never cached beyond the
/// enclosing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagContextResult {
    pub results: Vec<RagResult>,
    pub total_results: usize,
    pub processing_ms: u64,
    pub strategy_source: StrategySource,
}

/// Timestamp alias used where the cache and cold-tier schema need a
/// wall-clock value (fingerprints and TTLs are UTC epoch seconds).
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

//! Backend adapter trait and closed provider dispatch.
//!
//! [`BackendClient`] is an enum wrapping a concrete provider adapter chosen
//! at construction time from a backend's configured [`crate::model::BackendKind`].
//! All routing code interacts with the same [`BackendAdapter`] surface;
//! adapter-specific protocol differences — schema translation, auth headers,
//! endpoint paths — are fully encapsulated in the adapter modules.

mod anthropic;
mod ollama;
mod openai;
mod qwen;
pub mod tokenizer;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use qwen::QwenAdapter;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;

use crate::config::BackendConfig;
use crate::error::ClaudetteError;
use crate::model::{BackendDescriptor, BackendKind, FailureKind, Request};
use crate::pool::Pool;

/// What one successful adapter call produced, before the Router attaches
/// timing, cache, and routing metadata to build a full [`crate::model::Response`].
#[derive(Debug, Clone)]
pub struct AdapterOutcome {
    pub content: String,
    pub tokens_input: u32,
    pub tokens_output: u32,
    pub token_source: crate::model::TokenSource,
    pub finish_reason: Option<String>,
    pub model: String,
}

/// Result of a liveness probe.
#[derive(Debug, Clone, Copy)]
pub struct HealthProbeOutcome {
    pub healthy: bool,
    pub latency_ms: u64,
}

/// A single configuration problem surfaced by `validate_config`.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

/// The capability set every backend adapter implements.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> BackendKind;

    async fn send(&self, request: &Request, pool: &Pool) -> Result<AdapterOutcome, ClaudetteError>;

    async fn probe_health(&self, pool: &Pool) -> Result<HealthProbeOutcome, ClaudetteError>;

    /// `costEUR = (tokensInput + tokensOutput) / 1000 * costPerKToken`,
    /// always computed — never skipped on a successful response.
    fn estimate_cost(&self, tokens_input: u32, tokens_output: u32) -> Decimal {
        let total = Decimal::from(tokens_input + tokens_output);
        (total / Decimal::from(1000)) * self.cost_per_k_token()
    }

    fn cost_per_k_token(&self) -> Decimal;

    fn validate_config(&self) -> Vec<ConfigIssue>;

    /// Whether this adapter honors a given request option (e.g. `"temperature"`).
    fn supports(&self, option: &str) -> bool {
        matches!(option, "temperature" | "max_tokens")
    }
}

/// Unified backend client — enum dispatch over concrete provider adapters.
pub enum BackendClient {
    OpenAi(OpenAiAdapter),
    Anthropic(AnthropicAdapter),
    Qwen(QwenAdapter),
    Ollama(OllamaAdapter),
}

impl BackendClient {
    pub fn new(descriptor: &BackendDescriptor) -> Result<Self, ClaudetteError> {
        Ok(match descriptor.kind {
            BackendKind::OpenAi => Self::OpenAi(OpenAiAdapter::new(descriptor.clone())),
            BackendKind::AnthropicClaude => {
                let key = descriptor.api_key.clone().ok_or_else(|| {
                    ClaudetteError::new(
                        crate::error::ErrorKind::CredentialMissing,
                        "anthropic_claude backend requires an API key",
                    )
                    .with_backend(descriptor.name.clone())
                })?;
                Self::Anthropic(AnthropicAdapter::new(descriptor.clone(), key))
            }
            BackendKind::QwenCompatible => Self::Qwen(QwenAdapter::new(descriptor.clone())),
            BackendKind::OllamaLocal => Self::Ollama(OllamaAdapter::new(descriptor.clone())),
        })
    }

    pub fn from_config(name: &str, cfg: &BackendConfig) -> Result<Self, ClaudetteError> {
        let descriptor = BackendDescriptor {
            name: name.to_string(),
            kind: cfg.provider.resolve(),
            enabled: cfg.enabled,
            priority: cfg.priority,
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| default_base_url(cfg.provider.resolve())),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            cost_per_k_token: cfg.cost_per_k_token,
            health_path: cfg.health_path.clone(),
            timeout_ms: cfg.timeout_ms,
        };
        Self::new(&descriptor)
    }
}

fn default_base_url(kind: BackendKind) -> String {
    match kind {
        BackendKind::OpenAi => "https://api.openai.com".to_string(),
        BackendKind::AnthropicClaude => "https://api.anthropic.com".to_string(),
        BackendKind::QwenCompatible => "https://dashscope.aliyuncs.com/compatible-mode".to_string(),
        BackendKind::OllamaLocal => "http://localhost:11434".to_string(),
    }
}

#[async_trait]
impl BackendAdapter for BackendClient {
    fn name(&self) -> &str {
        match self {
            Self::OpenAi(a) => a.name(),
            Self::Anthropic(a) => a.name(),
            Self::Qwen(a) => a.name(),
            Self::Ollama(a) => a.name(),
        }
    }

    fn kind(&self) -> BackendKind {
        match self {
            Self::OpenAi(a) => a.kind(),
            Self::Anthropic(a) => a.kind(),
            Self::Qwen(a) => a.kind(),
            Self::Ollama(a) => a.kind(),
        }
    }

    async fn send(&self, request: &Request, pool: &Pool) -> Result<AdapterOutcome, ClaudetteError> {
        match self {
            Self::OpenAi(a) => a.send(request, pool).await,
            Self::Anthropic(a) => a.send(request, pool).await,
            Self::Qwen(a) => a.send(request, pool).await,
            Self::Ollama(a) => a.send(request, pool).await,
        }
    }

    async fn probe_health(&self, pool: &Pool) -> Result<HealthProbeOutcome, ClaudetteError> {
        match self {
            Self::OpenAi(a) => a.probe_health(pool).await,
            Self::Anthropic(a) => a.probe_health(pool).await,
            Self::Qwen(a) => a.probe_health(pool).await,
            Self::Ollama(a) => a.probe_health(pool).await,
        }
    }

    fn cost_per_k_token(&self) -> Decimal {
        match self {
            Self::OpenAi(a) => a.cost_per_k_token(),
            Self::Anthropic(a) => a.cost_per_k_token(),
            Self::Qwen(a) => a.cost_per_k_token(),
            Self::Ollama(a) => a.cost_per_k_token(),
        }
    }

    fn validate_config(&self) -> Vec<ConfigIssue> {
        match self {
            Self::OpenAi(a) => a.validate_config(),
            Self::Anthropic(a) => a.validate_config(),
            Self::Qwen(a) => a.validate_config(),
            Self::Ollama(a) => a.validate_config(),
        }
    }
}

/// Merge attached files into the prompt per the request's context strategy.
/// Shared by every adapter so file handling stays consistent across providers.
pub(crate) fn compose_prompt(request: &Request) -> String {
    use crate::model::ContextStrategy;
    if request.files.is_empty() {
        return request.prompt.clone();
    }
    let joined = request
        .files
        .iter()
        .map(|f| format!("# {}\n{}", f.path, f.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    match request.options.context_strategy {
        ContextStrategy::Prepend => format!("{joined}\n\n{}", request.prompt),
        ContextStrategy::Append => format!("{}\n\n{joined}", request.prompt),
        ContextStrategy::Inject => format!("{}\n\n[context]\n{joined}", request.prompt),
    }
}

/// Whether a failure body matches the context-length-exceeded heuristic.
/// Counted as a plain `client_error` toward the breaker (see
/// [`classify_http_status`]) but surfaced to callers as its own
/// [`crate::error::ErrorKind::ContextLengthExceeded`].
pub(crate) fn is_context_length_exceeded(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("context_length_exceeded") || lower.contains("maximum context length")
}

/// Map an HTTP status (and, for 4xx bodies, a context-length heuristic) onto
/// the shared failure taxonomy. `None` means success.
pub(crate) fn classify_http_status(status: StatusCode, body: &str) -> Option<FailureKind> {
    if status.is_success() {
        return None;
    }
    if is_context_length_exceeded(body) {
        return Some(FailureKind::ClientError);
    }
    Some(match status.as_u16() {
        401 | 403 => FailureKind::Auth,
        400 | 404 | 422 => FailureKind::ClientError,
        408 | 504 => FailureKind::Timeout,
        409 | 425 | 429 => FailureKind::RateLimit,
        500..=599 => FailureKind::ServerError,
        _ => FailureKind::Other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_errors() {
        assert_eq!(classify_http_status(StatusCode::UNAUTHORIZED, ""), Some(FailureKind::Auth));
        assert_eq!(classify_http_status(StatusCode::FORBIDDEN, ""), Some(FailureKind::Auth));
    }

    #[test]
    fn classifies_rate_limit_and_timeout() {
        assert_eq!(classify_http_status(StatusCode::TOO_MANY_REQUESTS, ""), Some(FailureKind::RateLimit));
        assert_eq!(classify_http_status(StatusCode::GATEWAY_TIMEOUT, ""), Some(FailureKind::Timeout));
    }

    #[test]
    fn classifies_server_error_range() {
        assert_eq!(classify_http_status(StatusCode::BAD_GATEWAY, ""), Some(FailureKind::ServerError));
    }

    #[test]
    fn success_status_classifies_as_none() {
        assert_eq!(classify_http_status(StatusCode::OK, ""), None);
    }

    #[test]
    fn context_length_body_overrides_status_classification() {
        let outcome = classify_http_status(
            StatusCode::BAD_REQUEST,
            r#"{"error": "This model's maximum context length is 4096 tokens"}"#,
        );
        assert_eq!(outcome, Some(FailureKind::ClientError));
    }
}

//! Configuration types for Claudette.
//!
//! Config is authored as TOML and loaded once at startup, then validated
//! before the runtime opens any backend connections. The shape mirrors the
//! JSON configuration schema this core is contractually validated against:
//! `[backends.<name>]`, `[features]`, `[thresholds]`, `[rag]` (with
//! `[rag.providers.<name>]` and a `fallback_chain`), and `[router]` weights.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//!
//! [backends.openai]
//! provider = "openai"
//! model    = "gpt-4o-mini"
//! cost_per_k_token = "0.00015"
//!
//! [backends.local]
//! provider = "ollama_local"
//! base_url = "http://localhost:11434"
//!
//! [router.weights]
//! cost = 0.4
//! latency = 0.4
//! availability = 0.2
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::BackendKind;

/// Wire-level provider tag. `Flexcon` is a configuration alias for
/// [`BackendKind::QwenCompatible`] (see DESIGN.md) — same adapter, distinct
/// `base_url`/`cost_per_k_token` per backend entry.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigProvider {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic_claude")]
    AnthropicClaude,
    #[serde(rename = "qwen_compatible")]
    QwenCompatible,
    Flexcon,
    #[serde(rename = "ollama_local")]
    OllamaLocal,
}

impl ConfigProvider {
    pub fn resolve(self) -> BackendKind {
        match self {
            Self::OpenAi => BackendKind::OpenAi,
            Self::AnthropicClaude => BackendKind::AnthropicClaude,
            Self::QwenCompatible | Self::Flexcon => BackendKind::QwenCompatible,
            Self::OllamaLocal => BackendKind::OllamaLocal,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    #[serde(default)]
    pub features: FeaturesConfig,

    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    #[serde(default)]
    pub rag: RagConfig,

    #[serde(default)]
    pub router: RouterConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.router.weights.normalize();
        let report = config.validate();
        anyhow::ensure!(report.is_valid(), "invalid config: {}", report.errors.join("; "));
        Ok(config)
    }

    /// Validate without constructing a runtime. Never panics or returns
    /// `Err` for user-data problems — callers inspect [`ValidationReport`].
    pub fn validate(&self) -> ValidationReport {
        let mut errors = Vec::new();

        let backend_names: HashSet<&str> = self.backends.keys().map(String::as_str).collect();

        for (name, backend) in &self.backends {
            if backend.cost_per_k_token.is_sign_negative() {
                errors.push(format!("backend `{name}` has negative cost_per_k_token"));
            }
            if backend.max_tokens == 0 {
                errors.push(format!("backend `{name}` has max_tokens of 0"));
            }
        }

        let provider_names: HashSet<&str> = self.rag.providers.keys().map(String::as_str).collect();
        for provider in &self.rag.fallback_chain {
            if !provider_names.contains(provider.as_str()) {
                errors.push(format!(
                    "rag.fallback_chain references unknown provider `{provider}`"
                ));
            }
        }
        if let Some(default) = &self.rag.default_provider {
            if !provider_names.contains(default.as_str()) {
                errors.push(format!("rag.default_provider `{default}` is not a configured provider"));
            }
        }

        if self.router.max_attempts == 0 {
            errors.push("router.max_attempts must be at least 1".into());
        }
        if self.thresholds.cost_warning_eur.is_sign_negative() {
            errors.push("thresholds.cost_warning_eur must be non-negative".into());
        }

        if let Some(forced) = &self.router.forced_backend {
            if !backend_names.contains(forced.as_str()) {
                errors.push(format!("router.forced_backend references unknown backend `{forced}`"));
            }
        }
        for name in &provider_names {
            if backend_names.contains(name) {
                errors.push(format!("`{name}` is configured as both a backend and a rag provider; names must be unique across sections"));
            }
        }

        ValidationReport { errors }
    }

    /// Resolve the API key for a backend from the environment, following
    /// the provider's conventional variable name, or a backend's own
    /// `api_key_env` override when set.
    pub fn resolve_api_key(&self, name: &str) -> Option<String> {
        let backend = self.backends.get(name)?;
        if let Some(var) = &backend.api_key_env {
            return std::env::var(var).ok();
        }
        let var = match backend.provider.resolve() {
            BackendKind::OpenAi => "OPENAI_API_KEY",
            BackendKind::AnthropicClaude => "ANTHROPIC_API_KEY",
            BackendKind::QwenCompatible => match backend.provider {
                ConfigProvider::Flexcon => "FLEXCON_API_KEY",
                _ => "QWEN_API_KEY",
            },
            BackendKind::OllamaLocal => return None,
        };
        std::env::var(var).ok()
    }
}

/// Outcome of [`Config::validate`]. Never throws — callers branch on
/// [`Self::is_valid`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Ambient server settings — ports, logging, data directory, admin auth.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Directory containing the persistent cold cache (`cache.db`).
    #[serde(default = "defaults::data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub admin_token_env: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_port: defaults::client_port(),
            admin_port: defaults::admin_port(),
            traffic_log_capacity: defaults::traffic_log_capacity(),
            log_level: None,
            data_dir: defaults::data_dir(),
            admin_token_env: None,
        }
    }
}

/// One named backend entry under `[backends.<name>]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    pub cost_per_k_token: Decimal,
    pub model: String,
    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "defaults::temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Inline API key — discouraged; prefer credential resolution via
    /// `api_key_env` or the provider's conventional environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub provider: ConfigProvider,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub health_path: Option<String>,
}

/// Feature toggles. Everything defaults to `true` except `compression` and
/// `summarization`, which are opt-in.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeaturesConfig {
    #[serde(default = "defaults::on")]
    pub caching: bool,
    #[serde(default = "defaults::on")]
    pub cost_optimization: bool,
    #[serde(default = "defaults::on")]
    pub smart_routing: bool,
    #[serde(default = "defaults::on")]
    pub performance_monitoring: bool,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub summarization: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            caching: true,
            cost_optimization: true,
            smart_routing: true,
            performance_monitoring: true,
            compression: false,
            summarization: false,
        }
    }
}

/// Numeric limits consulted by the cache and router.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThresholdsConfig {
    #[serde(default = "defaults::cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "defaults::max_cache_entries")]
    pub max_cache_entries: usize,
    #[serde(default = "defaults::cost_warning_eur")]
    pub cost_warning_eur: Decimal,
    #[serde(default = "defaults::max_context_tokens")]
    pub max_context_tokens: u32,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: defaults::cache_ttl_seconds(),
            max_cache_entries: defaults::max_cache_entries(),
            cost_warning_eur: defaults::cost_warning_eur(),
            max_context_tokens: defaults::max_context_tokens(),
        }
    }
}

/// RAG provider registry and fallback ordering.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RagConfig {
    #[serde(default)]
    pub providers: HashMap<String, toml::Value>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub default_provider: Option<String>,
}

/// Scoring weights and retry ceiling for the adaptive router.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub weights: RouterWeights,
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
    /// Operator override pinning every request to one backend, the
    /// config-level equivalent of a request's `options.backend`. Unset by
    /// default, letting the adaptive scorer choose.
    #[serde(default)]
    pub forced_backend: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            weights: RouterWeights::default(),
            max_attempts: defaults::max_attempts(),
            forced_backend: None,
        }
    }
}

/// Cost/latency/availability weights used by the scoring function
/// `S = w_c·C + w_l·L + w_a·A`. Normalized to sum to `1.0` at load time
/// when the configured sum strays more than `±0.01` from it — including
/// the all-zero case, which normalizes to `1/3` each.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RouterWeights {
    #[serde(default = "defaults::weight_third")]
    pub cost: f64,
    #[serde(default = "defaults::weight_third")]
    pub latency: f64,
    #[serde(default = "defaults::weight_third")]
    pub availability: f64,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            cost: defaults::weight_third(),
            latency: defaults::weight_third(),
            availability: defaults::weight_third(),
        }
    }
}

impl RouterWeights {
    pub fn normalize(&mut self) {
        let sum = self.cost + self.latency + self.availability;
        if (sum - 1.0).abs() <= 0.01 {
            return;
        }
        if sum <= f64::EPSILON {
            self.cost = 1.0 / 3.0;
            self.latency = 1.0 / 3.0;
            self.availability = 1.0 / 3.0;
            return;
        }
        self.cost /= sum;
        self.latency /= sum;
        self.availability /= sum;
    }
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn traffic_log_capacity() -> usize { 500 }
    pub fn data_dir() -> String { "./data".to_string() }
    pub fn enabled() -> bool { true }
    pub fn max_tokens() -> u32 { 4096 }
    pub fn temperature() -> f32 { 0.7 }
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn on() -> bool { true }
    pub fn cache_ttl_seconds() -> u64 { 3600 }
    pub fn max_cache_entries() -> usize { 10_000 }
    pub fn cost_warning_eur() -> super::Decimal {
        super::Decimal::new(1, 0)
    }
    pub fn max_context_tokens() -> u32 { 32_000 }
    pub fn max_attempts() -> u32 { 3 }
    pub fn weight_third() -> f64 { 1.0 / 3.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [backends.openai]
            provider = "openai"
            model = "gpt-4o-mini"
            cost_per_k_token = "0.00015"

            [backends.local]
            provider = "ollama_local"
            model = "qwen2.5:7b"
            cost_per_k_token = "0"

            [rag.providers.docs]
            kind = "static"

            [rag]
            fallback_chain = ["docs"]
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn validation_passes_for_minimal_config() {
        let config = minimal_config();
        let report = config.validate();
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn validation_rejects_unknown_fallback_provider() {
        let mut config = minimal_config();
        config.rag.fallback_chain.push("nonexistent".into());
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn validation_rejects_negative_cost() {
        let mut config = minimal_config();
        config.backends.get_mut("openai").unwrap().cost_per_k_token = Decimal::new(-1, 2);
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn flexcon_provider_resolves_to_qwen_compatible_kind() {
        assert_eq!(ConfigProvider::Flexcon.resolve(), BackendKind::QwenCompatible);
        assert_eq!(ConfigProvider::QwenCompatible.resolve(), BackendKind::QwenCompatible);
    }

    #[test]
    fn router_weights_normalize_zero_sum_to_thirds() {
        let mut weights = RouterWeights { cost: 0.0, latency: 0.0, availability: 0.0 };
        weights.normalize();
        assert!((weights.cost - 1.0 / 3.0).abs() < 1e-9);
        assert!((weights.latency - 1.0 / 3.0).abs() < 1e-9);
        assert!((weights.availability - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn router_weights_normalize_rescales_nonunit_sum() {
        let mut weights = RouterWeights { cost: 1.0, latency: 1.0, availability: 2.0 };
        weights.normalize();
        assert!((weights.cost + weights.latency + weights.availability - 1.0).abs() < 1e-9);
        assert!((weights.availability - 0.5).abs() < 1e-9);
    }

    #[test]
    fn router_weights_within_tolerance_are_left_untouched() {
        let mut weights = RouterWeights { cost: 0.34, latency: 0.33, availability: 0.335 };
        let before = weights;
        weights.normalize();
        assert_eq!(weights, before);
    }

    #[test]
    fn gateway_defaults_are_applied_when_section_is_minimal() {
        let config = minimal_config();
        assert_eq!(config.gateway.client_port, 8080);
        assert_eq!(config.gateway.admin_port, 8081);
        assert_eq!(config.gateway.data_dir, "./data");
    }
}

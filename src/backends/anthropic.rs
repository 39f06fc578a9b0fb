//! Anthropic Messages API adapter.
//!
//! Translates Claudette's internal request shape into Anthropic's
//! [`/v1/messages`](https://docs.anthropic.com/en/api/messages) schema and
//! back. The translation functions, `to_anthropic`/`from_anthropic`, are
//! `pub(crate)` so they stay unit testable independent of the HTTP layer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::error::{ClaudetteError, ErrorKind};
use crate::model::{BackendDescriptor, BackendKind, FailureKind, Request, TokenSource};
use crate::pool::Pool;

use super::{
    classify_http_status, compose_prompt, is_context_length_exceeded, tokenizer, AdapterOutcome, BackendAdapter, ConfigIssue,
    HealthProbeOutcome,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct AnthropicAdapter {
    descriptor: BackendDescriptor,
    api_key: String,
}

impl AnthropicAdapter {
    pub fn new(descriptor: BackendDescriptor, api_key: String) -> Self {
        Self { descriptor, api_key }
    }

    fn headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            header::HeaderValue::from_str(&self.api_key).expect("API key contains invalid header characters"),
        );
        headers.insert("anthropic-version", header::HeaderValue::from_static(ANTHROPIC_VERSION));
        headers
    }
}

/// Build an Anthropic Messages request from a Claudette request.
pub(crate) fn to_anthropic(request: &Request, model: &str, max_tokens: u32, temperature: f32) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": request.options.max_tokens.unwrap_or(max_tokens),
        "messages": [{"role": "user", "content": compose_prompt(request)}],
        "temperature": request.options.temperature.unwrap_or(temperature),
    });
    if let Some(query) = &request.options.rag_query {
        body["system"] = json!(format!("Use the following retrieval query as guidance: {query}"));
    }
    body
}

/// Translate an Anthropic Messages response into an [`AdapterOutcome`].
pub(crate) fn from_anthropic(resp: &Value, prompt: &str) -> Result<AdapterOutcome, ClaudetteError> {
    let content = resp["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str())
        .ok_or_else(|| ClaudetteError::new(ErrorKind::Internal, "no text block in Anthropic response"))?
        .to_string();

    let model = resp["model"].as_str().unwrap_or("unknown").to_string();
    let finish_reason = match resp["stop_reason"].as_str().unwrap_or("stop") {
        "end_turn" => "stop",
        "max_tokens" => "length",
        other => other,
    }
    .to_string();

    let (tokens_input, tokens_output, token_source) =
        match (resp["usage"]["input_tokens"].as_u64(), resp["usage"]["output_tokens"].as_u64()) {
            (Some(input), Some(output)) => (input as u32, output as u32, TokenSource::Reported),
            _ => (tokenizer::estimate_tokens(prompt), tokenizer::estimate_tokens(&content), TokenSource::Estimated),
        };

    Ok(AdapterOutcome {
        content,
        tokens_input,
        tokens_output,
        token_source,
        finish_reason: Some(finish_reason),
        model,
    })
}

#[async_trait]
impl BackendAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::AnthropicClaude
    }

    async fn send(&self, request: &Request, pool: &Pool) -> Result<AdapterOutcome, ClaudetteError> {
        let model = request
            .options
            .model
            .clone()
            .unwrap_or_else(|| self.descriptor.model.clone());
        let prompt = compose_prompt(request);
        let body = to_anthropic(request, &model, self.descriptor.max_tokens, self.descriptor.temperature);

        let url = format!("{}/v1/messages", self.descriptor.base_url);
        let client = reqwest::Client::new();
        let req = client
            .post(&url)
            .headers(self.headers())
            .timeout(Duration::from_millis(self.descriptor.timeout_ms))
            .json(&body)
            .build()
            .map_err(|e| ClaudetteError::new(ErrorKind::Internal, "failed to build request").with_cause(e))?;

        let response = pool.send_request(req).await.map_err(|e| {
            let kind = if e.is_timeout() { ErrorKind::BackendTimeout } else { ErrorKind::BackendConnection };
            ClaudetteError::new(kind, e.to_string())
                .with_backend(self.descriptor.name.clone())
                .with_cause(e)
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            ClaudetteError::new(ErrorKind::BackendConnection, "failed to read response body")
                .with_backend(self.descriptor.name.clone())
                .with_cause(e)
        })?;

        if let Some(failure) = classify_http_status(status, &text) {
            let kind = if failure == FailureKind::ClientError && is_context_length_exceeded(&text) {
                ErrorKind::ContextLengthExceeded
            } else {
                ErrorKind::from_failure_kind(failure)
            };
            return Err(ClaudetteError::new(kind, text).with_backend(self.descriptor.name.clone()).with_failure_kind(failure));
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|e| {
            ClaudetteError::new(ErrorKind::Internal, "failed to parse Anthropic response as JSON")
                .with_backend(self.descriptor.name.clone())
                .with_cause(e)
        })?;

        from_anthropic(&parsed, &prompt).map_err(|e| e.with_backend(self.descriptor.name.clone()))
    }

    async fn probe_health(&self, pool: &Pool) -> Result<HealthProbeOutcome, ClaudetteError> {
        // Anthropic has no `/v1/models` endpoint; a 1-token completion is
        // the cheapest reliable way to verify auth + connectivity.
        let probe = json!({
            "model": self.descriptor.model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        let url = format!("{}/v1/messages", self.descriptor.base_url);
        let client = reqwest::Client::new();
        let req = client
            .post(&url)
            .headers(self.headers())
            .json(&probe)
            .build()
            .map_err(|e| ClaudetteError::new(ErrorKind::Internal, "failed to build probe request").with_cause(e))?;

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(HEALTH_PROBE_TIMEOUT, pool.send_request(req)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(response)) => Ok(HealthProbeOutcome { healthy: response.status().is_success(), latency_ms }),
            Ok(Err(_)) => Ok(HealthProbeOutcome { healthy: false, latency_ms }),
            Err(_) => Ok(HealthProbeOutcome { healthy: false, latency_ms: HEALTH_PROBE_TIMEOUT.as_millis() as u64 }),
        }
    }

    fn cost_per_k_token(&self) -> Decimal {
        self.descriptor.cost_per_k_token
    }

    fn validate_config(&self) -> Vec<ConfigIssue> {
        if self.api_key.is_empty() {
            vec![ConfigIssue { field: "api_key".into(), message: "anthropic_claude requires a non-empty API key".into() }]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestOptions;

    fn request(prompt: &str) -> Request {
        Request::new(prompt).with_options(RequestOptions::default())
    }

    #[test]
    fn to_anthropic_uses_configured_max_tokens_by_default() {
        let body = to_anthropic(&request("hi"), "claude-haiku-4-5", 8192, 0.5);
        assert_eq!(body["max_tokens"], 8192);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn to_anthropic_honors_request_override() {
        let mut req = request("hi");
        req.options.max_tokens = Some(256);
        let body = to_anthropic(&req, "claude-haiku-4-5", 8192, 0.5);
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn from_anthropic_maps_end_turn_to_stop() {
        let resp = json!({
            "model": "claude-haiku-4-5",
            "content": [{"type": "text", "text": "Hello!"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let outcome = from_anthropic(&resp, "hi").unwrap();
        assert_eq!(outcome.content, "Hello!");
        assert_eq!(outcome.finish_reason.as_deref(), Some("stop"));
        assert_eq!(outcome.tokens_input, 10);
        assert_eq!(outcome.tokens_output, 5);
        assert!(matches!(outcome.token_source, TokenSource::Reported));
    }

    #[test]
    fn from_anthropic_maps_max_tokens_to_length() {
        let resp = json!({
            "model": "claude-haiku-4-5",
            "content": [{"type": "text", "text": "…"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 100, "output_tokens": 1024},
        });
        let outcome = from_anthropic(&resp, "hi").unwrap();
        assert_eq!(outcome.finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn from_anthropic_errors_without_text_block() {
        let resp = json!({
            "model": "claude-haiku-4-5",
            "content": [{"type": "tool_use", "id": "t1", "name": "calc", "input": {}}],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        assert!(from_anthropic(&resp, "hi").is_err());
    }

    #[test]
    fn from_anthropic_estimates_when_usage_missing() {
        let resp = json!({
            "model": "claude-haiku-4-5",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "end_turn",
        });
        let outcome = from_anthropic(&resp, "hello world").unwrap();
        assert!(matches!(outcome.token_source, TokenSource::Estimated));
    }
}

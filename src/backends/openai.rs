//! OpenAI chat completions adapter.
//!
//! Talks to `POST /v1/chat/completions` using the standard OpenAI request
//! and response schema. A single `reqwest::Client` used to be built once
//! per backend; it's now routed through the shared [`Pool`] instead of
//! owning its own client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde_json::{json, Value};

use crate::error::{ClaudetteError, ErrorKind};
use crate::model::{BackendDescriptor, BackendKind, FailureKind, Request, TokenSource};
use crate::pool::Pool;

use super::{
    classify_http_status, compose_prompt, is_context_length_exceeded, tokenizer, AdapterOutcome, BackendAdapter, ConfigIssue,
    HealthProbeOutcome,
};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct OpenAiAdapter {
    descriptor: BackendDescriptor,
}

impl OpenAiAdapter {
    pub fn new(descriptor: BackendDescriptor) -> Self {
        Self { descriptor }
    }

    fn build_request(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let client = reqwest::Client::new();
        let mut builder = client
            .post(url)
            .timeout(Duration::from_millis(self.descriptor.timeout_ms))
            .json(body);
        if let Some(key) = &self.descriptor.api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        builder
    }
}

#[async_trait]
impl BackendAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OpenAi
    }

    async fn send(&self, request: &Request, pool: &Pool) -> Result<AdapterOutcome, ClaudetteError> {
        let prompt = compose_prompt(request);
        let model = request
            .options
            .model
            .clone()
            .unwrap_or_else(|| self.descriptor.model.clone());
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": request.options.max_tokens.unwrap_or(self.descriptor.max_tokens),
            "temperature": request.options.temperature.unwrap_or(self.descriptor.temperature),
        });

        let url = format!("{}/v1/chat/completions", self.descriptor.base_url);
        let req = self
            .build_request(&url, &body)
            .build()
            .map_err(|e| ClaudetteError::new(ErrorKind::Internal, "failed to build request").with_cause(e))?;

        let response = pool.send_request(req).await.map_err(|e| {
            let kind = if e.is_timeout() {
                ErrorKind::BackendTimeout
            } else {
                ErrorKind::BackendConnection
            };
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
            ClaudetteError::new(ErrorKind::Internal, "failed to parse OpenAI response as JSON")
                .with_backend(self.descriptor.name.clone())
                .with_cause(e)
        })?;

        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish_reason = parsed
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        let model_used = parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&model)
            .to_string();

        let (tokens_input, tokens_output, token_source) =
            match (parsed.pointer("/usage/prompt_tokens"), parsed.pointer("/usage/completion_tokens")) {
                (Some(input), Some(output)) if input.as_u64().is_some() && output.as_u64().is_some() => (
                    input.as_u64().unwrap() as u32,
                    output.as_u64().unwrap() as u32,
                    TokenSource::Reported,
                ),
                _ => (
                    tokenizer::estimate_tokens(&prompt),
                    tokenizer::estimate_tokens(&content),
                    TokenSource::Estimated,
                ),
            };

        Ok(AdapterOutcome {
            content,
            tokens_input,
            tokens_output,
            token_source,
            finish_reason,
            model: model_used,
        })
    }

    async fn probe_health(&self, pool: &Pool) -> Result<HealthProbeOutcome, ClaudetteError> {
        let url = format!(
            "{}{}",
            self.descriptor.base_url,
            self.descriptor.health_path.as_deref().unwrap_or("/v1/models")
        );
        let client = reqwest::Client::new();
        let mut builder = client.get(&url);
        if let Some(key) = &self.descriptor.api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        let req = builder
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

    fn cost_per_k_token(&self) -> rust_decimal::Decimal {
        self.descriptor.cost_per_k_token
    }

    fn validate_config(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.descriptor.api_key.is_none() {
            issues.push(ConfigIssue {
                field: "api_key".into(),
                message: "no API key resolved for openai backend".into(),
            });
        }
        issues
    }
}

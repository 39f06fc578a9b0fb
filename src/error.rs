//! The closed error taxonomy every backend failure is classified into.
//!
//! [`ClaudetteError`] is the only error type the library's public surface
//! returns. It never exposes the internal `cause` chain to API consumers —
//! that chain exists purely so `tracing` can log a full trail while
//! `Display`/`Serialize` only ever show `kind`/`backend`/`message`.

use serde::Serialize;
use thiserror::Error;

use crate::model::FailureKind;

/// The closed taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    CredentialMissing,
    NoBackend,
    BackendAuth,
    BackendRateLimit,
    BackendTimeout,
    BackendConnection,
    BackendServer,
    BackendClient,
    ContextLengthExceeded,
    CacheUnavailable,
    RagUnavailable,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Retryable kinds: timeout, rate_limit, connection, server.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::BackendTimeout
                | Self::BackendRateLimit
                | Self::BackendConnection
                | Self::BackendServer
        )
    }

    /// Map an adapter-level [`FailureKind`] onto the taxonomy for a given backend.
    pub fn from_failure_kind(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => Self::BackendTimeout,
            FailureKind::Connection => Self::BackendConnection,
            FailureKind::RateLimit => Self::BackendRateLimit,
            FailureKind::Auth => Self::BackendAuth,
            FailureKind::ServerError => Self::BackendServer,
            FailureKind::ClientError => Self::BackendClient,
            FailureKind::Other => Self::Internal,
        }
    }
}

/// A classified error with retryability.
///
/// `Display` renders only `kind`/`backend`/`message` — never the `cause`
/// chain, which is retained solely for `tracing`'s structured logging via
/// `#[source]`.
#[derive(Debug, Error)]
#[error("{kind:?}{}: {message}", backend.as_deref().map(|b| format!(" ({b})")).unwrap_or_default())]
pub struct ClaudetteError {
    pub kind: ErrorKind,
    pub backend: Option<String>,
    pub message: String,
    #[source]
    pub cause: Option<anyhow::Error>,
    /// The underlying breaker-facing failure kind, when this error came from
    /// a backend call. Carried separately from `kind` because the breaker's
    /// bookkeeping groups failures more coarsely than the public error
    /// taxonomy distinguishes them — e.g. a context-length error is
    /// reported to callers as its own kind but still counts as a plain
    /// `client_error` toward the breaker's thresholds.
    pub failure_kind: Option<FailureKind>,
}

impl ClaudetteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            backend: None,
            message: message.into(),
            cause: None,
            failure_kind: None,
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_failure_kind(mut self, kind: FailureKind) -> Self {
        self.failure_kind = Some(kind);
        self
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    pub fn no_backend() -> Self {
        Self::new(ErrorKind::NoBackend, "no usable backend for this request")
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled or deadline exceeded")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    /// A structured JSON view safe to return to API consumers — no `cause`.
    pub fn to_public_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "backend": self.backend,
            "message": self.message,
            "retryable": self.retryable(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_spec_table() {
        assert!(ErrorKind::BackendTimeout.retryable());
        assert!(ErrorKind::BackendRateLimit.retryable());
        assert!(ErrorKind::BackendConnection.retryable());
        assert!(ErrorKind::BackendServer.retryable());
        assert!(!ErrorKind::BackendAuth.retryable());
        assert!(!ErrorKind::BackendClient.retryable());
        assert!(!ErrorKind::ConfigInvalid.retryable());
        assert!(!ErrorKind::CredentialMissing.retryable());
    }

    #[test]
    fn public_json_never_contains_cause() {
        let err = ClaudetteError::new(ErrorKind::BackendAuth, "invalid key")
            .with_backend("openai")
            .with_cause(anyhow::anyhow!("sk-verysecret leaked in logs"));
        let json = err.to_public_json();
        let rendered = json.to_string();
        assert!(!rendered.contains("sk-verysecret"));
        assert_eq!(json["kind"], "backend_auth");
        assert_eq!(json["backend"], "openai");
        assert_eq!(json["retryable"], false);
    }

    #[test]
    fn failure_kind_maps_onto_error_taxonomy() {
        assert_eq!(ErrorKind::from_failure_kind(FailureKind::Timeout), ErrorKind::BackendTimeout);
        assert_eq!(ErrorKind::from_failure_kind(FailureKind::Auth), ErrorKind::BackendAuth);
        assert_eq!(ErrorKind::from_failure_kind(FailureKind::Other), ErrorKind::Internal);
    }
}

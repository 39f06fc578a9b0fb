//! HTTP error mapping for axum handlers.
//!
//! [`AppError`] wraps [`ClaudetteError`] and converts it into a status code
//! plus the public JSON body from [`ClaudetteError::to_public_json`] — the
//! `cause` chain is logged via `tracing` but never serialized to the client.
//!
//! Any handler can return `Result<T, AppError>` and propagate with `?`,
//! including plain `anyhow::Error`s from code paths that haven't been
//! classified into the taxonomy yet.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::{ClaudetteError, ErrorKind};

#[derive(Debug)]
pub struct AppError(ClaudetteError);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.kind {
            ErrorKind::ConfigInvalid | ErrorKind::ContextLengthExceeded => StatusCode::BAD_REQUEST,
            ErrorKind::CredentialMissing | ErrorKind::BackendAuth => StatusCode::UNAUTHORIZED,
            ErrorKind::BackendRateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::NoBackend | ErrorKind::CacheUnavailable | ErrorKind::RagUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::BackendConnection | ErrorKind::BackendServer => StatusCode::BAD_GATEWAY,
            ErrorKind::BackendClient => StatusCode::BAD_REQUEST,
            ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(cause) = &self.0.cause {
            tracing::warn!(kind = ?self.0.kind, backend = ?self.0.backend, error = %cause, "handler error");
        } else {
            tracing::warn!(kind = ?self.0.kind, backend = ?self.0.backend, "handler error");
        }
        let status = self.status();
        (status, Json(self.0.to_public_json())).into_response()
    }
}

impl From<ClaudetteError> for AppError {
    fn from(e: ClaudetteError) -> Self {
        Self(e)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self(ClaudetteError::internal(e.to_string()).with_cause(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_retryable_kinds_to_gateway_statuses() {
        let err = AppError(ClaudetteError::new(ErrorKind::BackendTimeout, "slow"));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);

        let err = AppError(ClaudetteError::new(ErrorKind::NoBackend, "none usable"));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn maps_auth_to_401() {
        let err = AppError(ClaudetteError::new(ErrorKind::BackendAuth, "bad key"));
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }
}

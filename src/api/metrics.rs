//! Prometheus-compatible `/metrics` endpoint.
//!
//! Rendering itself lives in [`crate::observability::Observability::render`]
//! — lifetime counters, not a windowed scan — this handler is a thin HTTP
//! wrapper around it.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::lifecycle::Runtime;

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], runtime.metrics())
}

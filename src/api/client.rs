//! Client-facing API (port 8080) — the endpoint applications talk to.
//!
//! This is intentionally a thin layer: all routing, caching, and RAG logic
//! lives in [`crate::lifecycle::Runtime`]. Handlers translate HTTP concerns
//! (status codes, JSON bodies) into calls against the runtime and back.

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::http_error::AppError;
use crate::lifecycle::Runtime;
use crate::model::{FileRef, RequestOptions};

/// Build the client-facing axum router (port 8080).
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/optimize", post(optimize))
        .with_state(runtime)
}

#[derive(Debug, Deserialize)]
pub struct OptimizeRequest {
    pub prompt: String,
    #[serde(default)]
    pub files: Vec<FileRef>,
    #[serde(default)]
    pub options: RequestOptions,
}

/// `POST /optimize` — the library's single request/response entry point,
/// exposed over HTTP.
pub async fn optimize(State(runtime): State<Arc<Runtime>>, Json(body): Json<OptimizeRequest>) -> Result<impl IntoResponse, AppError> {
    let response = runtime.optimize(body.prompt, body.files, body.options).await?;
    Ok(Json(response))
}

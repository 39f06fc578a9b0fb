//! Admin API (port 8081) — operator-facing introspection endpoints.
//!
//! These endpoints are separated onto a different port so they can be
//! network-restricted independently of the client API (e.g. accessible only
//! from the internal Docker network, never exposed to the internet).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::credentials::mask;
use crate::lifecycle::Runtime;

/// Build the admin-facing axum router (port 8081).
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/admin/status", get(status))
        .route("/admin/config", get(config))
        .route("/admin/traffic", get(traffic))
        .route("/metrics", get(crate::api::metrics::metrics))
        .layer(middleware::from_fn_with_state(Arc::clone(&runtime), crate::api::admin_auth::admin_auth_middleware))
        .with_state(runtime)
}

/// `GET /admin/status` — backend liveness, breaker state, and aggregate
/// counters, exposed over HTTP for operators.
pub async fn status(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    Json(runtime.status())
}

/// `GET /admin/config` — the active config with secrets redacted.
pub async fn config(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    let cfg = runtime.config();
    let backends: Vec<_> = cfg
        .backends
        .iter()
        .map(|(name, b)| {
            json!({
                "name": name,
                "provider": b.provider,
                "model": b.model,
                "enabled": b.enabled,
                "priority": b.priority,
                "base_url": b.base_url,
                "api_key_env": b.api_key_env,
                "api_key": cfg.resolve_api_key(name).as_deref().map(mask),
            })
        })
        .collect();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "traffic_log_capacity": cfg.gateway.traffic_log_capacity,
        },
        "backends": backends,
        "features": cfg.features,
        "thresholds": cfg.thresholds,
        "router": cfg.router,
        "rag_fallback_chain": cfg.rag.fallback_chain,
    }))
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// `GET /admin/traffic?limit=N` — recent traffic entries plus aggregate stats.
pub async fn traffic(State(runtime): State<Arc<Runtime>>, Query(q): Query<TrafficQuery>) -> impl IntoResponse {
    let entries = runtime.traffic().recent(q.limit).await;
    let stats = runtime.traffic().stats().await;
    Json(json!({ "stats": stats, "entries": entries }))
}

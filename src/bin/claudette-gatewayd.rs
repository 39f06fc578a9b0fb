//! HTTP gateway binary: exposes `Runtime::optimize` and the rest of the
//! library surface over a two-port shape — a client-facing API and a
//! separately bindable admin API.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use claudette::lifecycle::Runtime;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // Avoids needing curl/wget inside the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "claudette=info,tower_http=warn".into()))
        .init();

    let config_path = std::env::var("CLAUDETTE_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/etc/claudette/config.toml"));

    let runtime = Runtime::initialize(&config_path).await.with_context(|| format!("failed to initialize runtime from {}", config_path.display()))?;
    runtime.spawn_background_tasks();

    let client_port = runtime.config().gateway.client_port;
    let admin_port = runtime.config().gateway.admin_port;
    info!(client_port, admin_port, "claudette starting");

    let client_addr: SocketAddr = format!("0.0.0.0:{client_port}").parse()?;
    let admin_addr: SocketAddr = format!("0.0.0.0:{admin_port}").parse()?;

    let client_listener = tokio::net::TcpListener::bind(client_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;
    info!(%client_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = claudette::api::client::router(Arc::clone(&runtime))
        .layer(axum::middleware::from_fn(claudette::api::request_id::request_id_middleware))
        .layer(trace_layer());
    let admin_app = claudette::api::admin::router(Arc::clone(&runtime))
        .layer(axum::middleware::from_fn(claudette::api::request_id::request_id_middleware))
        .layer(trace_layer());

    tokio::select! {
        result = axum::serve(client_listener, client_app) => {
            result.context("client API server error")?;
        }
        result = axum::serve(admin_listener, admin_app) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    runtime.cleanup().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler").recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `claudette-gatewayd --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("CLAUDETTE_CLIENT_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

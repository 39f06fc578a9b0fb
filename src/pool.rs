//! Process-wide HTTP connection pool, keyed by origin.
//!
//! Each backend adapter used to build its own `reqwest::Client` (one client
//! per backend, built once, timeout baked in); this generalizes that into a
//! shared pool keyed by `scheme://host` so multiple backends on the same
//! origin share sockets. `reqwest` owns the actual connection reuse;
//! [`Pool`] additionally tracks in-flight counts per origin for the gauges
//! the Observability module exports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use reqwest::Client;

const MAX_IDLE_PER_HOST: usize = 10;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TRANSPORT_RETRIES: u32 = 2;
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(2);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Per-origin socket occupancy, read by the Observability module for the
/// `pool_active_sockets` gauge.
#[derive(Debug, Default)]
struct OriginGauge {
    active: AtomicU64,
}

/// Shared HTTP client pool. Cheap to clone (wraps `Arc` internals).
#[derive(Clone)]
pub struct Pool {
    clients: Arc<DashMap<String, Client>>,
    gauges: Arc<DashMap<String, OriginGauge>>,
    shutting_down: Arc<AtomicBool>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            gauges: Arc::new(DashMap::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    fn origin_of(url: &str) -> String {
        match reqwest::Url::parse(url) {
            Ok(parsed) => format!("{}://{}", parsed.scheme(), parsed.host_str().unwrap_or("unknown")),
            Err(_) => url.to_string(),
        }
    }

    /// Return the client for `url`'s origin, building one on first use.
    pub fn client_for(&self, url: &str) -> Client {
        let origin = Self::origin_of(url);
        if let Some(existing) = self.clients.get(&origin) {
            return existing.clone();
        }
        let client = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        self.clients.insert(origin, client.clone());
        client
    }

    fn track_active(&self, origin: &str, delta: i64) {
        let gauge = self.gauges.entry(origin.to_string()).or_default();
        if delta >= 0 {
            gauge.active.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            gauge.active.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
    }

    /// Execute a pre-built request, retrying transport-level failures
    /// (connect/DNS/TLS/timeout) up to [`MAX_TRANSPORT_RETRIES`] times with
    /// jittered exponential backoff. Any other retry (across backends,
    /// after a non-transport failure) is the Router's responsibility.
    pub async fn send_request(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        let origin = Self::origin_of(request.url().as_str());
        let client = self.client_for(request.url().as_str());
        self.track_active(&origin, 1);
        let mut attempt = 0u32;
        let result = loop {
            let to_send = request
                .try_clone()
                .expect("streaming request bodies cannot be retried");
            match client.execute(to_send).await {
                Ok(response) => break Ok(response),
                Err(err) if attempt < MAX_TRANSPORT_RETRIES && (err.is_connect() || err.is_timeout()) => {
                    attempt += 1;
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(err) => break Err(err),
            }
        };
        self.track_active(&origin, -1);
        result
    }

    /// Active socket counts per origin, for the `pool_active_sockets` gauge.
    pub fn gauges(&self) -> HashMap<String, u64> {
        self.gauges
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().active.load(Ordering::Relaxed)))
            .collect()
    }

    /// Idle capacity remaining per origin against [`MAX_IDLE_PER_HOST`], for
    /// the `pool_free_sockets` gauge. `reqwest` doesn't expose its real idle
    /// pool occupancy, so this approximates it from the configured per-host
    /// cap minus what [`Self::send_request`] is currently tracking as active.
    pub fn free_gauges(&self) -> HashMap<String, u64> {
        let cap = MAX_IDLE_PER_HOST as u64;
        self.gauges
            .iter()
            .map(|entry| (entry.key().clone(), cap.saturating_sub(entry.value().active.load(Ordering::Relaxed).min(cap))))
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Stop accepting new origin clients. In-flight requests get up to
    /// [`SHUTDOWN_DRAIN`] to complete, enforced by the caller via
    /// `tokio::time::timeout` (`reqwest` has no native cancel handle).
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn shutdown_drain(&self) -> Duration {
        SHUTDOWN_DRAIN
    }
}

/// Exponential backoff with jitter: base 250 ms, doubling per attempt,
/// capped at 2 s.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
    let capped = exp.min(BACKOFF_CAP.as_millis() as u64);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4 + 1);
    Duration::from_millis(capped.saturating_sub(jitter))
}

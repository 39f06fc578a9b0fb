//! Two-tier response cache with single-flight coalescing.
//!
//! Built on `dashmap`-backed concurrent maps (reused for both the hot tier
//! and the in-flight table) and a `cache_key` fingerprinting convention
//! similar to other retrieval-augmented gateways. The cold tier is
//! advisory: any failure there is logged and ignored, never surfaced to
//! the caller.

pub mod cold;
pub mod fingerprint;
pub mod hot;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::model::Response;

pub use cold::ColdTier;
pub use fingerprint::Fingerprint;
pub use hot::CacheEntry;
use hot::HotTier;

/// Two-tier cache façade. One instance per [`crate::lifecycle::Runtime`].
pub struct Cache {
    hot: Arc<HotTier>,
    cold: ColdTier,
    in_flight: DashMap<Fingerprint, Arc<Notify>>,
    ttl: Duration,
}

impl Cache {
    pub fn new(data_dir: &Path, max_entries: usize, ttl_seconds: u64) -> anyhow::Result<Self> {
        Ok(Self {
            hot: Arc::new(HotTier::new(max_entries)),
            cold: ColdTier::open(data_dir)?,
            in_flight: DashMap::new(),
            ttl: Duration::from_secs(ttl_seconds),
        })
    }

    pub fn in_memory(max_entries: usize, ttl_seconds: u64) -> Self {
        Self {
            hot: Arc::new(HotTier::new(max_entries)),
            cold: ColdTier::open_in_memory().expect("in-memory sqlite connection cannot fail to open"),
            in_flight: DashMap::new(),
            ttl: Duration::from_secs(ttl_seconds),
        }
    }

    /// Hot-tier hit, else cold-tier read-through (warming the hot tier on
    /// success). Returns `None` on a true miss or an expired entry.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Response> {
        if let Some(entry) = self.hot.get(fingerprint) {
            return Some(entry.response);
        }
        let entry = self.cold.get(fingerprint).await?;
        if entry.is_expired() {
            return None;
        }
        let response = entry.response.clone();
        self.hot.insert(entry);
        Some(response)
    }

    /// Atomic with respect to the hot tier; the cold-tier write happens
    /// afterward and never fails the call.
    pub async fn set(&self, fingerprint: Fingerprint, response: Response) {
        let entry = CacheEntry::new(fingerprint, response, self.ttl);
        self.hot.insert(entry.clone());
        self.cold.set(entry).await;
    }

    /// Registers this fingerprint as in-flight, returning `true` if the
    /// caller won the race and must perform the upstream call, or `false`
    /// if it should wait on the returned [`Notify`] for the winner to
    /// finish and then re-check [`Self::get`].
    pub fn begin_single_flight(&self, fingerprint: &Fingerprint) -> (bool, Arc<Notify>) {
        match self.in_flight.entry(fingerprint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (false, e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let notify = Arc::new(Notify::new());
                e.insert(notify.clone());
                (true, notify)
            }
        }
    }

    pub fn end_single_flight(&self, fingerprint: &Fingerprint) {
        if let Some((_, notify)) = self.in_flight.remove(fingerprint) {
            notify.notify_waiters();
        }
    }

    pub async fn compact(&self) -> anyhow::Result<usize> {
        self.cold.compact().await
    }

    /// Spawns the daily cold-tier compaction loop.
    pub fn spawn_compaction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
            loop {
                interval.tick().await;
                match cache.compact().await {
                    Ok(deleted) => tracing::info!(deleted, "cold cache compaction finished"),
                    Err(e) => tracing::warn!(error = %e, "cold cache compaction failed"),
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.hot.len()
    }

    /// Hot-tier bytes currently tracked against its soft budget, for the
    /// `cache_size_bytes` gauge.
    pub fn size_bytes(&self) -> u64 {
        self.hot.bytes_used()
    }

    pub fn is_empty(&self) -> bool {
        self.hot.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Request, ResponseMetadata};
    use rust_decimal::Decimal;

    fn response(content: &str) -> Response {
        Response {
            content: content.to_string(),
            backend_used: "openai".into(),
            tokens_input: 1,
            tokens_output: 1,
            cost_eur: Decimal::ZERO,
            latency_ms: 5,
            cache_hit: false,
            metadata: ResponseMetadata::default(),
        }
    }

    #[tokio::test]
    async fn set_then_get_hits_hot_tier() {
        let cache = Cache::in_memory(100, 3600);
        let fp = fingerprint::compute(&Request::new("2+2"));
        cache.set(fp.clone(), response("4")).await;
        let hit = cache.get(&fp).await.unwrap();
        assert_eq!(hit.content, "4");
    }

    #[tokio::test]
    async fn bypass_means_caller_simply_never_calls_get_or_set() {
        // bypassCache is a router-level decision (RequestOptions::bypass_cache),
        // not a Cache API — verified here only to document the contract.
        let cache = Cache::in_memory(100, 3600);
        let fp = fingerprint::compute(&Request::new("2+2"));
        assert!(cache.get(&fp).await.is_none());
    }

    #[tokio::test]
    async fn single_flight_second_caller_waits_for_winner() {
        let cache = Arc::new(Cache::in_memory(100, 3600));
        let fp = fingerprint::compute(&Request::new("2+2"));

        let (first_wins, _) = cache.begin_single_flight(&fp);
        let (second_wins, notify) = cache.begin_single_flight(&fp);
        assert!(first_wins);
        assert!(!second_wins);

        let cache2 = Arc::clone(&cache);
        let fp2 = fp.clone();
        let waiter = tokio::spawn(async move {
            notify.notified().await;
            cache2.get(&fp2).await
        });

        cache.set(fp.clone(), response("4")).await;
        cache.end_single_flight(&fp);

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap().content, "4");
    }
}

//! In-memory hot tier and its pressure-driven eviction policy.
//!
//! `dashmap` is already a dependency for the pool's per-origin client
//! table; reused here for the same reason — a concurrent map without an
//! external lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::model::{now_utc, Response};

use super::fingerprint::Fingerprint;

/// Soft byte budget for the hot tier, tracked by summing [`CacheEntry::size`]
/// rather than reading real OS memory pressure (see DESIGN.md).
const DEFAULT_BYTE_BUDGET: u64 = 64 * 1024 * 1024;
const RECENCY_CAP_HOURS: f64 = 168.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Low,
    Medium,
    High,
    Critical,
}

fn pressure_level(used: u64, budget: u64) -> PressureLevel {
    if budget == 0 {
        return PressureLevel::Critical;
    }
    let ratio = used as f64 / budget as f64;
    if ratio < 0.75 {
        PressureLevel::Low
    } else if ratio < 0.85 {
        PressureLevel::Medium
    } else if ratio < 0.95 {
        PressureLevel::High
    } else {
        PressureLevel::Critical
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub response: Response,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub size: u64,
    pub hit_count: u64,
    pub last_access: chrono::DateTime<chrono::Utc>,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, response: Response, ttl: std::time::Duration) -> Self {
        let now = now_utc();
        let size = estimate_size(&response);
        Self {
            fingerprint,
            response,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(3600)),
            size,
            hit_count: 0,
            last_access: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        now_utc() >= self.expires_at
    }

    /// `popularity·0.4 − recency·0.4 − size·0.2`; lower sorts first (evicted first).
    fn eviction_score(&self) -> f64 {
        let popularity = (1.0 + self.hit_count as f64).ln();
        let hours_stale = (now_utc() - self.last_access).num_seconds() as f64 / 3600.0;
        let recency = hours_stale.clamp(0.0, RECENCY_CAP_HOURS);
        let size_component = self.size as f64;
        popularity * 0.4 - recency * 0.4 - size_component * 0.2
    }
}

fn estimate_size(response: &Response) -> u64 {
    (response.content.len() + response.backend_used.len() + 64) as u64
}

/// Concurrent fingerprint → entry map with a pressure-aware eviction pass.
pub struct HotTier {
    entries: DashMap<Fingerprint, CacheEntry>,
    bytes_used: AtomicU64,
    byte_budget: u64,
    max_entries: usize,
}

impl HotTier {
    pub fn new(max_entries: usize) -> Self {
        Self { entries: DashMap::new(), bytes_used: AtomicU64::new(0), byte_budget: DEFAULT_BYTE_BUDGET, max_entries }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut entry = self.entries.get_mut(fingerprint)?;
        if entry.is_expired() {
            drop(entry);
            self.remove(fingerprint);
            return None;
        }
        entry.hit_count += 1;
        entry.last_access = now_utc();
        Some(entry.clone())
    }

    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.entries.get(fingerprint).map(|e| e.clone())
    }

    pub fn insert(&self, entry: CacheEntry) {
        self.bytes_used.fetch_add(entry.size, Ordering::Relaxed);
        if let Some(prior) = self.entries.insert(entry.fingerprint.clone(), entry) {
            self.bytes_used.fetch_sub(prior.size, Ordering::Relaxed);
        }
        self.evict_if_needed();
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let removed = self.entries.remove(fingerprint).map(|(_, e)| e);
        if let Some(entry) = &removed {
            self.bytes_used.fetch_sub(entry.size, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.bytes_used.store(0, Ordering::Relaxed);
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Relaxed)
    }

    /// Evict by memory pressure first, then by entry-count budget.
    pub fn evict_if_needed(&self) {
        match pressure_level(self.bytes_used(), self.byte_budget) {
            PressureLevel::Low => {}
            PressureLevel::Medium => self.evict_until_below(0.75),
            PressureLevel::High => self.evict_until_below(0.5),
            PressureLevel::Critical => self.clear(),
        }
        while self.entries.len() > self.max_entries {
            if !self.evict_lowest_scored() {
                break;
            }
        }
    }

    fn evict_until_below(&self, target_ratio: f64) {
        let target_bytes = (self.byte_budget as f64 * target_ratio) as u64;
        while self.bytes_used() > target_bytes {
            if !self.evict_lowest_scored() {
                break;
            }
        }
    }

    /// Remove the single worst-scored entry (ties broken by oldest access).
    fn evict_lowest_scored(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().eviction_score(), e.value().last_access))
            .fold(None, |best: Option<(Fingerprint, f64, chrono::DateTime<chrono::Utc>)>, candidate| match best {
                None => Some(candidate),
                Some(b) if candidate.1 < b.1 || (candidate.1 == b.1 && candidate.2 < b.2) => Some(candidate),
                Some(b) => Some(b),
            });
        match victim {
            Some((fingerprint, _, _)) => {
                self.remove(&fingerprint);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for HotTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotTier").field("len", &self.entries.len()).field("bytes_used", &self.bytes_used()).finish()
    }
}

pub type SharedHotTier = Arc<HotTier>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseMetadata;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn response(content: &str) -> Response {
        Response {
            content: content.to_string(),
            backend_used: "openai".into(),
            tokens_input: 1,
            tokens_output: 1,
            cost_eur: Decimal::ZERO,
            latency_ms: 10,
            cache_hit: false,
            metadata: ResponseMetadata::default(),
        }
    }

    #[test]
    fn insert_then_get_returns_entry_and_increments_hit_count() {
        let tier = HotTier::new(100);
        let fp = Fingerprint("abc".into());
        tier.insert(CacheEntry::new(fp.clone(), response("4"), Duration::from_secs(60)));
        let hit = tier.get(&fp).unwrap();
        assert_eq!(hit.hit_count, 1);
    }

    #[test]
    fn expired_entry_returns_none_and_is_purged() {
        let tier = HotTier::new(100);
        let fp = Fingerprint("abc".into());
        let mut entry = CacheEntry::new(fp.clone(), response("4"), Duration::from_secs(60));
        entry.expires_at = now_utc() - chrono::Duration::seconds(1);
        tier.insert(entry);
        assert!(tier.get(&fp).is_none());
        assert!(tier.peek(&fp).is_none());
    }

    #[test]
    fn entry_count_eviction_respects_max_entries() {
        let tier = HotTier::new(2);
        for i in 0..5 {
            let fp = Fingerprint(format!("fp-{i}"));
            tier.insert(CacheEntry::new(fp, response("x"), Duration::from_secs(60)));
        }
        assert!(tier.len() <= 2);
    }

    #[test]
    fn pressure_level_thresholds_match_spec_bands() {
        assert_eq!(pressure_level(70, 100), PressureLevel::Low);
        assert_eq!(pressure_level(80, 100), PressureLevel::Medium);
        assert_eq!(pressure_level(90, 100), PressureLevel::High);
        assert_eq!(pressure_level(96, 100), PressureLevel::Critical);
    }

    #[test]
    fn higher_hit_count_scores_above_untouched_entry() {
        let fp_a = Fingerprint("a".into());
        let fp_b = Fingerprint("b".into());
        let mut popular = CacheEntry::new(fp_a, response("x"), Duration::from_secs(60));
        let cold = CacheEntry::new(fp_b, response("x"), Duration::from_secs(60));
        popular.hit_count = 50;
        assert!(popular.eviction_score() > cold.eviction_score());
    }
}

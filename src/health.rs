//! Health Monitor: periodic liveness probes per backend.
//!
//! A `tokio::spawn`ed loop on a fixed tick, the same shape as a config
//! file watcher but generalized from "watch one file's mtime" to "probe
//! every registered backend". Health records live only in memory and
//! carry a TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::backends::{BackendAdapter, BackendClient};
use crate::model::HealthRecord;
use crate::pool::Pool;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const RECORD_TTL: Duration = Duration::from_secs(30);
/// Pessimistic latency assumed for a backend between registration and its
/// first completed probe.
const P50_ESTIMATE_MS: u64 = 400;

/// Shared, lock-free-per-entry table of per-backend health records.
#[derive(Clone, Default)]
pub struct HealthTable {
    records: Arc<DashMap<String, HealthRecord>>,
}

impl HealthTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, inserting an optimistic placeholder record and
    /// scheduling (but not awaiting) an immediate warm-up probe.
    pub fn register(&self, name: &str) {
        self.records
            .entry(name.to_string())
            .or_insert_with(|| HealthRecord::optimistic_placeholder(P50_ESTIMATE_MS));
    }

    pub fn get(&self, name: &str) -> Option<HealthRecord> {
        self.records.get(name).map(|r| r.clone())
    }

    pub fn is_stale(&self, name: &str) -> bool {
        self.get(name).map(|r| r.is_stale(RECORD_TTL)).unwrap_or(true)
    }

    fn set(&self, name: &str, record: HealthRecord) {
        self.records.insert(name.to_string(), record);
    }

    /// Record the outcome of an out-of-band probe — e.g. one the Router
    /// fires when it notices a stale record mid-request — using the same
    /// failure-streak bookkeeping as the background monitor's own ticks.
    pub fn record_probe(&self, name: &str, healthy: bool, latency_ms: u64) {
        let failure_streak = if healthy { 0 } else { previous_streak(self, name) + 1 };
        self.set(name, HealthRecord { healthy, latency_ms, last_probe: Instant::now(), failure_streak });
    }

    pub fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.records.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }
}

/// Background loop driving the health table. Holds a shutdown [`Notify`]
/// so the Lifecycle Controller can stop probing before the Pool shuts down.
pub struct HealthMonitor {
    table: HealthTable,
    shutdown: Arc<Notify>,
}

impl HealthMonitor {
    pub fn new(table: HealthTable) -> Self {
        Self { table, shutdown: Arc::new(Notify::new()) }
    }

    pub fn table(&self) -> HealthTable {
        self.table.clone()
    }

    /// Run one probe pass across every backend, immediately (used both for
    /// the registration warm-up and each tick of the background loop).
    pub async fn probe_all(&self, backends: &HashMap<String, Arc<BackendClient>>, pool: &Pool) {
        for (name, backend) in backends {
            self.probe_one(name, backend, pool).await;
        }
    }

    async fn probe_one(&self, name: &str, backend: &Arc<BackendClient>, pool: &Pool) {
        let started = Instant::now();
        let outcome = tokio::time::timeout(PROBE_TIMEOUT, backend.probe_health(pool)).await;
        let record = match outcome {
            Ok(Ok(probe)) => HealthRecord {
                healthy: probe.healthy,
                latency_ms: probe.latency_ms,
                last_probe: Instant::now(),
                failure_streak: if probe.healthy { 0 } else { previous_streak(&self.table, name) + 1 },
            },
            Ok(Err(_)) | Err(_) => HealthRecord {
                healthy: false,
                latency_ms: started.elapsed().as_millis() as u64,
                last_probe: Instant::now(),
                failure_streak: previous_streak(&self.table, name) + 1,
            },
        };
        self.table.set(name, record);
    }

    /// Spawn the 30 s polling loop. Returns a handle the Lifecycle
    /// Controller awaits (with a deadline) during shutdown.
    pub fn spawn(self: Arc<Self>, backends: HashMap<String, Arc<BackendClient>>, pool: Pool) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROBE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.probe_all(&backends, &pool).await;
                    }
                    _ = self.shutdown.notified() => {
                        tracing::info!("health monitor stopping");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

fn previous_streak(table: &HealthTable, name: &str) -> u32 {
    table.get(name).map(|r| r.failure_streak).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_inserts_optimistic_placeholder() {
        let table = HealthTable::new();
        table.register("openai");
        let record = table.get("openai").unwrap();
        assert!(record.healthy);
        assert_eq!(record.failure_streak, 0);
    }

    #[test]
    fn unregistered_backend_counts_as_stale() {
        let table = HealthTable::new();
        assert!(table.is_stale("missing"));
    }

    #[test]
    fn registered_backend_is_not_immediately_stale() {
        let table = HealthTable::new();
        table.register("local");
        assert!(!table.is_stale("local"));
    }

    #[test]
    fn snapshot_contains_all_registered_backends() {
        let table = HealthTable::new();
        table.register("a");
        table.register("b");
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
    }
}

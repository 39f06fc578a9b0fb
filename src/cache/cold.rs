//! Persistent cold tier: `rusqlite` against `${dataDir}/cache.db`.
//!
//! Write-through on insert, read-through on miss; every fallible operation
//! here is advisory — the cache is a performance optimization, not a
//! contract, so failures are logged at `warn!` and the caller proceeds as if
//! the cold tier were empty.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::model::Response;

use super::fingerprint::Fingerprint;
use super::hot::CacheEntry;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        fingerprint TEXT PRIMARY KEY,
        body        BLOB NOT NULL,
        created_at  INTEGER NOT NULL,
        expires_at  INTEGER NOT NULL,
        hit_count   INTEGER NOT NULL,
        last_access INTEGER NOT NULL,
        size        INTEGER NOT NULL
    )
";

/// What actually gets stored in `body` — the response plus enough metadata
/// to reconstruct a [`CacheEntry`] on read-through.
#[derive(Serialize, Deserialize)]
struct StoredBody {
    response: Response,
}

/// Blocking `rusqlite` connection behind a mutex, driven from async code via
/// `spawn_blocking`. A single connection per embedded store rather than
/// pooling — the workload is low-concurrency admin/cache traffic, not a
/// request-serving hot path.
#[derive(Clone)]
pub struct ColdTier {
    conn: Arc<Mutex<Connection>>,
}

impl ColdTier {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("cache.db"))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let conn = self.conn.clone();
        let key = fingerprint.0.clone();
        let result = tokio::task::spawn_blocking(move || read_row(&conn, &key)).await;
        match result {
            Ok(Ok(entry)) => entry,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "cold cache read failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "cold cache read task panicked");
                None
            }
        }
    }

    pub async fn set(&self, entry: CacheEntry) {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || write_row(&conn, &entry)).await;
        if let Ok(Err(e)) = result {
            tracing::warn!(error = %e, "cold cache write failed, continuing without persistence");
        }
    }

    /// Deletes rows whose `expires_at` has passed. Run from a daily
    /// `tokio::time::interval` task.
    pub async fn compact(&self) -> anyhow::Result<usize> {
        let conn = self.conn.clone();
        let now = chrono::Utc::now().timestamp();
        let deleted =
            tokio::task::spawn_blocking(move || -> rusqlite::Result<usize> {
                let conn = conn.lock().expect("cold cache mutex poisoned");
                conn.execute("DELETE FROM entries WHERE expires_at < ?1", params![now])
            })
            .await??;
        Ok(deleted)
    }
}

fn read_row(conn: &Mutex<Connection>, key: &str) -> rusqlite::Result<Option<CacheEntry>> {
    let conn = conn.lock().expect("cold cache mutex poisoned");
    let mut stmt = conn.prepare_cached(
        "SELECT body, created_at, expires_at, hit_count, last_access, size FROM entries WHERE fingerprint = ?1",
    )?;
    let row = stmt.query_row(params![key], |row| {
        let body: Vec<u8> = row.get(0)?;
        let created_at: i64 = row.get(1)?;
        let expires_at: i64 = row.get(2)?;
        let hit_count: i64 = row.get(3)?;
        let last_access: i64 = row.get(4)?;
        let size: i64 = row.get(5)?;
        Ok((body, created_at, expires_at, hit_count, last_access, size))
    });
    match row {
        Ok((body, created_at, expires_at, hit_count, last_access, size)) => {
            let stored: StoredBody = match serde_json::from_slice(&body) {
                Ok(v) => v,
                Err(_) => return Ok(None),
            };
            Ok(Some(CacheEntry {
                fingerprint: Fingerprint(key.to_string()),
                response: stored.response,
                created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_else(chrono::Utc::now),
                expires_at: chrono::DateTime::from_timestamp(expires_at, 0).unwrap_or_else(chrono::Utc::now),
                size: size as u64,
                hit_count: hit_count as u64,
                last_access: chrono::DateTime::from_timestamp(last_access, 0).unwrap_or_else(chrono::Utc::now),
            }))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_row(conn: &Mutex<Connection>, entry: &CacheEntry) -> rusqlite::Result<()> {
    let body = serde_json::to_vec(&StoredBody { response: entry.response.clone() })
        .expect("response serialization cannot fail");
    let conn = conn.lock().expect("cold cache mutex poisoned");
    conn.execute(
        "INSERT INTO entries (fingerprint, body, created_at, expires_at, hit_count, last_access, size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(fingerprint) DO UPDATE SET
            body = excluded.body, expires_at = excluded.expires_at,
            hit_count = excluded.hit_count, last_access = excluded.last_access, size = excluded.size",
        params![
            entry.fingerprint.0,
            body,
            entry.created_at.timestamp(),
            entry.expires_at.timestamp(),
            entry.hit_count as i64,
            entry.last_access.timestamp(),
            entry.size as i64,
        ],
    )?;
    Ok(())
}

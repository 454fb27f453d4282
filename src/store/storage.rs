//! Storage trait and SQLite implementation for the read cache and the outbox.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::http::RequestDescriptor;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// A cached GET payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  pub payload: Value,
  pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

/// A write waiting in the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
  /// Insertion order; replay order
  pub id: i64,
  pub request: RequestDescriptor,
  pub timestamp: DateTime<Utc>,
  pub idempotency_key: String,
  /// Deferred replay attempts so far
  pub attempts: u32,
}

/// A write about to be appended to the outbox.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub request: RequestDescriptor,
  pub timestamp: DateTime<Utc>,
  pub idempotency_key: String,
}

/// Trait for local store backends.
pub trait Storage: Send + Sync {
  /// Get a cache entry by key, expired or not.
  fn get_cached(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Insert or overwrite a cache entry.
  fn put_cached(&self, entry: &CacheEntry) -> Result<()>;

  /// Delete one cache entry. Returns whether it existed.
  fn delete_cached(&self, key: &str) -> Result<bool>;

  /// All cache keys.
  fn cache_keys(&self) -> Result<Vec<String>>;

  /// Delete entries that expired at or before `now`.
  fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

  /// Delete every cache entry.
  fn clear_cache(&self) -> Result<usize>;

  /// Append to the outbox and return the new id.
  fn enqueue(&self, mutation: &NewMutation) -> Result<i64>;

  /// Outbox contents, oldest first.
  fn pending(&self) -> Result<Vec<PendingMutation>>;

  /// Remove a mutation from the outbox. Returns whether it existed.
  fn delete_pending(&self, id: i64) -> Result<bool>;

  /// Bump the attempt counter and return the new value.
  fn record_attempt(&self, id: i64) -> Result<u32>;

  fn pending_count(&self) -> Result<usize>;
}

/// Storage implementation that doesn't store anything.
/// Used once the store is degraded - all operations are no-ops.
pub struct NoopStorage;

impl Storage for NoopStorage {
  fn get_cached(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put_cached(&self, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete_cached(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn cache_keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }

  fn clear_cache(&self) -> Result<usize> {
    Ok(0)
  }

  fn enqueue(&self, _mutation: &NewMutation) -> Result<i64> {
    Err(eyre!("Outbox is unavailable"))
  }

  fn pending(&self) -> Result<Vec<PendingMutation>> {
    Ok(Vec::new())
  }

  fn delete_pending(&self, _id: i64) -> Result<bool> {
    Ok(false)
  }

  fn record_attempt(&self, _id: i64) -> Result<u32> {
    Ok(0)
  }

  fn pending_count(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based store implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .wrap_err_with(|| format!("Failed to create store directory {}", parent.display()))?;
    }

    let conn = Connection::open(path)
      .wrap_err_with(|| format!("Failed to open store at {}", path.display()))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Bring the schema up to [`SCHEMA_VERSION`].
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;

    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .wrap_err("Failed to read schema version")?;

    if version < 1 {
      conn
        .execute_batch(SCHEMA_V1)
        .wrap_err("Failed to run store migrations")?;
    }

    if version > SCHEMA_VERSION {
      return Err(eyre!(
        "Store schema version {} is newer than supported version {}",
        version,
        SCHEMA_VERSION
      ));
    }

    Ok(())
  }
}

/// Initial schema: read cache + outbox.
const SCHEMA_V1: &str = r#"
BEGIN;

CREATE TABLE IF NOT EXISTS api_cache (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    cached_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT,
    timestamp INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_timestamp
    ON pending_mutations(timestamp);

PRAGMA user_version = 1;

COMMIT;
"#;

impl Storage for SqliteStorage {
  fn get_cached(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;

    let row: Option<(String, i64)> = conn
      .query_row(
        "SELECT payload, expires_at FROM api_cache WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .wrap_err("Failed to read cache entry")?;

    match row {
      Some((payload, expires_at)) => {
        let payload: Value = serde_json::from_str(&payload)
          .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
        Ok(Some(CacheEntry {
          key: key.to_string(),
          payload,
          expires_at: from_millis(expires_at),
        }))
      }
      None => Ok(None),
    }
  }

  fn put_cached(&self, entry: &CacheEntry) -> Result<()> {
    let conn = self.conn()?;
    let payload = entry.payload.to_string();

    conn
      .execute(
        "INSERT OR REPLACE INTO api_cache (key, payload, expires_at, cached_at)
         VALUES (?, ?, ?, ?)",
        params![
          entry.key,
          payload,
          entry.expires_at.timestamp_millis(),
          Utc::now().timestamp_millis()
        ],
      )
      .wrap_err("Failed to store cache entry")?;

    Ok(())
  }

  fn delete_cached(&self, key: &str) -> Result<bool> {
    let conn = self.conn()?;
    let deleted = conn
      .execute("DELETE FROM api_cache WHERE key = ?", params![key])
      .wrap_err("Failed to delete cache entry")?;
    Ok(deleted > 0)
  }

  fn cache_keys(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM api_cache ORDER BY key")
      .wrap_err("Failed to prepare cache key query")?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .wrap_err("Failed to list cache keys")?
      .collect::<rusqlite::Result<Vec<String>>>()
      .wrap_err("Failed to read cache key")?;

    Ok(keys)
  }

  fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
    let conn = self.conn()?;
    let purged = conn
      .execute(
        "DELETE FROM api_cache WHERE expires_at <= ?",
        params![now.timestamp_millis()],
      )
      .wrap_err("Failed to purge expired cache entries")?;
    Ok(purged)
  }

  fn clear_cache(&self) -> Result<usize> {
    let conn = self.conn()?;
    let cleared = conn
      .execute("DELETE FROM api_cache", [])
      .wrap_err("Failed to clear cache")?;
    Ok(cleared)
  }

  fn enqueue(&self, mutation: &NewMutation) -> Result<i64> {
    let conn = self.conn()?;
    let request = &mutation.request;
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO pending_mutations (url, method, headers, body, timestamp, idempotency_key)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          request.url,
          request.method,
          headers,
          request.body,
          mutation.timestamp.timestamp_millis(),
          mutation.idempotency_key
        ],
      )
      .wrap_err("Failed to enqueue mutation")?;

    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, timestamp, idempotency_key, attempts
         FROM pending_mutations
         ORDER BY id",
      )
      .wrap_err("Failed to prepare outbox query")?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Option<String>>(4)?,
          row.get::<_, i64>(5)?,
          row.get::<_, String>(6)?,
          row.get::<_, u32>(7)?,
        ))
      })
      .wrap_err("Failed to query outbox")?
      .collect::<rusqlite::Result<Vec<_>>>()
      .wrap_err("Failed to read outbox row")?;

    let mut mutations = Vec::with_capacity(rows.len());
    for (id, url, method, headers, body, timestamp, idempotency_key, attempts) in rows {
      let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
        .map_err(|e| eyre!("Failed to deserialize headers of mutation {}: {}", id, e))?;
      mutations.push(PendingMutation {
        id,
        request: RequestDescriptor {
          url,
          method,
          headers,
          body,
        },
        timestamp: from_millis(timestamp),
        idempotency_key,
        attempts,
      });
    }

    Ok(mutations)
  }

  fn delete_pending(&self, id: i64) -> Result<bool> {
    let conn = self.conn()?;
    let deleted = conn
      .execute("DELETE FROM pending_mutations WHERE id = ?", params![id])
      .wrap_err("Failed to delete mutation")?;
    Ok(deleted > 0)
  }

  fn record_attempt(&self, id: i64) -> Result<u32> {
    let conn = self.conn()?;
    let updated = conn
      .execute(
        "UPDATE pending_mutations SET attempts = attempts + 1 WHERE id = ?",
        params![id],
      )
      .wrap_err("Failed to record replay attempt")?;
    if updated == 0 {
      return Ok(0);
    }

    let attempts: u32 = conn
      .query_row(
        "SELECT attempts FROM pending_mutations WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .wrap_err("Failed to read replay attempts")?;
    Ok(attempts)
  }

  fn pending_count(&self) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| {
        row.get(0)
      })
      .wrap_err("Failed to count outbox")?;
    Ok(count as usize)
  }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
  Utc
    .timestamp_millis_opt(millis)
    .single()
    .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

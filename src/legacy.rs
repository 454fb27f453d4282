//! Read-only view of the previous-generation offline store.
//!
//! Older clients queued writes in a separate database with a looser record
//! shape and no status column. Nothing is migrated in bulk: records are read
//! during replay and deleted one by one once the server has answered them.
//! A missing database file reads as an empty store.

use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use rusqlite::{params, Connection, OpenFlags};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::http::RequestDescriptor;

/// Table holding legacy records as JSON text.
pub const LEGACY_TABLE: &str = "offline_requests";

/// The two record shapes written by older clients.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyRecord {
  /// `{action, data, timestamp}`: an action name plus its JSON payload
  Action {
    action: String,
    #[serde(default)]
    data: Value,
  },
  /// `{data: {url, method, headers, body}}`: a captured request
  Request { data: LegacyRequest },
}

#[derive(Debug, Deserialize)]
struct LegacyRequest {
  url: String,
  #[serde(default = "default_method")]
  method: String,
  #[serde(default)]
  headers: BTreeMap<String, String>,
  #[serde(default)]
  body: Option<Value>,
}

fn default_method() -> String {
  "POST".to_string()
}

pub struct LegacyStore {
  conn: Option<Mutex<Connection>>,
  config: Config,
}

impl LegacyStore {
  /// Open the legacy database if it exists. Never creates it.
  pub fn open(path: &Path, config: &Config) -> Self {
    let conn = if path.exists() {
      match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE) {
        Ok(conn) => Some(Mutex::new(conn)),
        Err(e) => {
          warn!(path = %path.display(), error = %e, "Legacy store unreadable, ignoring it");
          None
        }
      }
    } else {
      debug!(path = %path.display(), "No legacy store present");
      None
    };

    Self {
      conn,
      config: config.clone(),
    }
  }

  /// A store with nothing in it.
  pub fn absent(config: &Config) -> Self {
    Self {
      conn: None,
      config: config.clone(),
    }
  }

  fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<Option<T>> {
    let Some(conn) = &self.conn else {
      return Ok(None);
    };
    let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if !table_exists(&conn)? {
      return Ok(None);
    }
    f(&conn).map(Some)
  }

  /// Replayable requests in id order. Records that match neither shape are
  /// skipped and left in place.
  pub fn requests(&self) -> Vec<(i64, RequestDescriptor)> {
    let rows = self.with_conn(|conn| {
      let mut stmt = conn
        .prepare(&format!("SELECT id, record FROM {} ORDER BY id", LEGACY_TABLE))
        .wrap_err("Failed to prepare legacy query")?;
      let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
        .wrap_err("Failed to query legacy store")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .wrap_err("Failed to read legacy record")?;
      Ok(rows)
    });

    let rows = match rows {
      Ok(rows) => rows.unwrap_or_default(),
      Err(e) => {
        warn!(error = ?e, "Failed to read legacy store");
        return Vec::new();
      }
    };

    rows
      .into_iter()
      .filter_map(|(id, record)| match self.to_request(&record) {
        Ok(request) => Some((id, request)),
        Err(e) => {
          warn!(id, error = %e, "Skipping unrecognised legacy record");
          None
        }
      })
      .collect()
  }

  /// Rebuild an equivalent request from a stored record.
  fn to_request(&self, record: &str) -> Result<RequestDescriptor> {
    let record: LegacyRecord =
      serde_json::from_str(record).map_err(|e| eyre!("Invalid legacy record: {}", e))?;

    let request = match record {
      LegacyRecord::Action { action, data } => {
        let path = format!(
          "{}{}",
          self.config.legacy.action_prefix,
          action.trim_start_matches('/')
        );
        RequestDescriptor::new("POST", self.config.upstream_url(&path))
          .with_header("content-type", "application/json")
          .with_body(data.to_string())
      }
      LegacyRecord::Request { data } => RequestDescriptor {
        url: self.config.upstream_url(&data.url),
        method: data.method.to_ascii_uppercase(),
        headers: data
          .headers
          .into_iter()
          .map(|(k, v)| (k.to_ascii_lowercase(), v))
          .collect(),
        body: data.body.map(|body| match body {
          Value::String(s) => s,
          other => other.to_string(),
        }),
      },
    };

    Ok(request)
  }

  /// Delete one legacy record after the server answered it for good.
  pub fn delete(&self, id: i64) -> bool {
    let result = self.with_conn(|conn| {
      let deleted = conn
        .execute(
          &format!("DELETE FROM {} WHERE id = ?", LEGACY_TABLE),
          params![id],
        )
        .wrap_err("Failed to delete legacy record")?;
      Ok(deleted > 0)
    });

    match result {
      Ok(deleted) => deleted.unwrap_or(false),
      Err(e) => {
        warn!(id, error = ?e, "Failed to delete legacy record");
        false
      }
    }
  }

  /// Number of records still in the legacy store.
  pub fn count(&self) -> usize {
    let result = self.with_conn(|conn| {
      let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {}", LEGACY_TABLE), [], |row| {
          row.get(0)
        })
        .wrap_err("Failed to count legacy records")?;
      Ok(count as usize)
    });

    match result {
      Ok(count) => count.unwrap_or(0),
      Err(e) => {
        warn!(error = ?e, "Failed to count legacy records");
        0
      }
    }
  }
}

fn table_exists(conn: &Connection) -> Result<bool> {
  let count: i64 = conn
    .query_row(
      "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
      params![LEGACY_TABLE],
      |row| row.get(0),
    )
    .wrap_err("Failed to inspect legacy schema")?;
  Ok(count > 0)
}

#[cfg(test)]
pub mod tests {
  use super::*;
  use tempfile::TempDir;

  /// Create a legacy database holding the given JSON records.
  pub fn seed_legacy(path: &Path, records: &[&str]) {
    let conn = Connection::open(path).unwrap();
    conn
      .execute_batch(&format!(
        "CREATE TABLE {} (id INTEGER PRIMARY KEY AUTOINCREMENT, record TEXT NOT NULL)",
        LEGACY_TABLE
      ))
      .unwrap();
    for record in records {
      conn
        .execute(
          &format!("INSERT INTO {} (record) VALUES (?)", LEGACY_TABLE),
          params![record],
        )
        .unwrap();
    }
  }

  fn config() -> Config {
    Config::with_upstream("https://api.example.org").unwrap()
  }

  #[test]
  fn test_missing_store_reads_as_empty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.db");
    let store = LegacyStore::open(&path, &config());

    assert_eq!(store.count(), 0);
    assert!(store.requests().is_empty());
    assert!(!store.delete(1));
    assert!(!path.exists());
  }

  #[test]
  fn test_missing_table_reads_as_empty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.db");
    Connection::open(&path).unwrap();

    let store = LegacyStore::open(&path, &config());
    assert_eq!(store.count(), 0);
  }

  #[test]
  fn test_both_record_shapes_become_requests() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.db");
    seed_legacy(
      &path,
      &[
        r#"{"action":"saveAttendance","data":{"participant":7},"timestamp":1700000000000}"#,
        r#"{"data":{"url":"/api/v1/points","method":"put","headers":{"Content-Type":"application/json"},"body":{"points":5}}}"#,
        r#"{"nonsense":true}"#,
      ],
    );

    let store = LegacyStore::open(&path, &config());
    assert_eq!(store.count(), 3);

    let requests = store.requests();
    assert_eq!(requests.len(), 2);

    let (_, action) = &requests[0];
    assert_eq!(action.method, "POST");
    assert_eq!(action.url, "https://api.example.org/api/saveAttendance");
    assert_eq!(action.body.as_deref(), Some(r#"{"participant":7}"#));

    let (id, captured) = &requests[1];
    assert_eq!(captured.method, "PUT");
    assert_eq!(captured.url, "https://api.example.org/api/v1/points");
    assert_eq!(
      captured.headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
    assert_eq!(captured.body.as_deref(), Some(r#"{"points":5}"#));

    assert!(store.delete(*id));
    assert_eq!(store.count(), 2);
  }
}

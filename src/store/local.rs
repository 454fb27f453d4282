//! Fail-open wrapper around a [`Storage`] backend.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::Report, Result};
use rusqlite::ErrorCode;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use super::storage::{CacheEntry, NewMutation, NoopStorage, PendingMutation, SqliteStorage, Storage};

/// The agent's local store.
///
/// Every operation is infallible from the caller's point of view. Once a
/// backend call fails because storage is unavailable or access is denied,
/// the store latches into degraded mode and behaves like [`NoopStorage`]
/// for the rest of its lifetime. Other storage errors are logged and
/// reported as a miss / nothing done.
pub struct LocalStore {
  backend: Box<dyn Storage>,
  degraded: AtomicBool,
}

impl LocalStore {
  /// Open the SQLite store at `path`, degrading if it cannot be opened.
  pub fn open(path: &Path) -> Self {
    match SqliteStorage::open(path) {
      Ok(storage) => Self::with_backend(Box::new(storage)),
      Err(e) => {
        warn!(path = %path.display(), error = ?e, "Local store unavailable, running without durability");
        Self {
          backend: Box::new(NoopStorage),
          degraded: AtomicBool::new(true),
        }
      }
    }
  }

  pub fn with_backend(backend: Box<dyn Storage>) -> Self {
    Self {
      backend,
      degraded: AtomicBool::new(false),
    }
  }

  pub fn is_degraded(&self) -> bool {
    self.degraded.load(Ordering::SeqCst)
  }

  fn backend(&self) -> &dyn Storage {
    if self.is_degraded() {
      &NoopStorage
    } else {
      self.backend.as_ref()
    }
  }

  /// Unwrap a backend result, latching degraded mode on access failures.
  fn settle<T>(&self, op: &str, result: Result<T>, fallback: T) -> T {
    match result {
      Ok(value) => value,
      Err(e) if is_access_failure(&e) => {
        if !self.degraded.swap(true, Ordering::SeqCst) {
          warn!(op, error = ?e, "Storage access denied, switching to degraded mode");
        }
        fallback
      }
      Err(e) => {
        error!(op, error = ?e, "Storage operation failed");
        fallback
      }
    }
  }

  /// Non-expired cache entry for `key`.
  pub fn get_cached(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
    let entry = self.settle("get_cached", self.backend().get_cached(key), None)?;
    if entry.is_expired(now) {
      return None;
    }
    Some(entry)
  }

  pub fn put_cached(&self, entry: &CacheEntry) {
    self.settle("put_cached", self.backend().put_cached(entry), ());
  }

  pub fn delete_cached(&self, key: &str) -> bool {
    self.settle("delete_cached", self.backend().delete_cached(key), false)
  }

  pub fn cache_keys(&self) -> Vec<String> {
    self.settle("cache_keys", self.backend().cache_keys(), Vec::new())
  }

  pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
    self.settle("purge_expired", self.backend().purge_expired(now), 0)
  }

  pub fn clear_cache(&self) -> usize {
    self.settle("clear_cache", self.backend().clear_cache(), 0)
  }

  /// Append to the outbox. `None` means the mutation was not persisted.
  pub fn enqueue(&self, mutation: &NewMutation) -> Option<i64> {
    if self.is_degraded() {
      return None;
    }
    self.settle("enqueue", self.backend.enqueue(mutation).map(Some), None)
  }

  pub fn pending(&self) -> Vec<PendingMutation> {
    self.settle("pending", self.backend().pending(), Vec::new())
  }

  pub fn delete_pending(&self, id: i64) -> bool {
    self.settle("delete_pending", self.backend().delete_pending(id), false)
  }

  pub fn record_attempt(&self, id: i64) -> u32 {
    self.settle("record_attempt", self.backend().record_attempt(id), 0)
  }

  pub fn pending_count(&self) -> usize {
    self.settle("pending_count", self.backend().pending_count(), 0)
  }
}

/// Whether an error means storage is unavailable or forbidden, as opposed
/// to a one-off failure.
pub fn is_access_failure(report: &Report) -> bool {
  report.chain().any(|cause| {
    if let Some(e) = cause.downcast_ref::<rusqlite::Error>() {
      return matches!(
        e.sqlite_error_code(),
        Some(
          ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly
            | ErrorCode::CannotOpen
            | ErrorCode::DiskFull
            | ErrorCode::AuthorizationForStatementDenied
        )
      );
    }
    if let Some(e) = cause.downcast_ref::<std::io::Error>() {
      return e.kind() == std::io::ErrorKind::PermissionDenied;
    }
    false
  })
}

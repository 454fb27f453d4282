//! Outbox replay.
//!
//! A replay cycle walks every queued write strictly oldest-first, one at a
//! time, current outbox before the legacy store. Each answer is classified:
//! - 2xx: delivered; removed from its store, then related cache keys purged
//! - 4xx: rejected for good; removed, never retried
//! - 5xx or transport failure: left in place for the next cycle
//!
//! A failing write never blocks the ones queued after it. Cycles never
//! overlap; a trigger arriving mid-cycle is dropped.

mod source;

use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::http::{UpstreamResponse, IDEMPOTENCY_HEADER};
use crate::invalidation;
use crate::legacy::LegacyStore;
use crate::policy::CachePolicy;
use crate::store::LocalStore;
use crate::transport::Transport;

pub use source::{LegacySource, MutationSource, OutboxSource};

/// How one replay attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
  Delivered,
  /// Client error: the request will never succeed as written
  Rejected(u16),
  /// Server error or no network: try again next cycle
  Deferred,
}

impl ReplayOutcome {
  pub fn classify(result: &Result<UpstreamResponse>) -> Self {
    match result {
      Ok(response) if response.is_success() => Self::Delivered,
      Ok(response) if response.is_client_error() => Self::Rejected(response.status),
      Ok(_) | Err(_) => Self::Deferred,
    }
  }
}

/// Tally of one replay cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
  pub delivered: usize,
  pub rejected: usize,
  pub deferred: usize,
  /// Auth requests found in a queue and thrown away unsent
  pub discarded: usize,
  /// Writes dropped after reaching the attempt ceiling
  pub dropped: usize,
  /// Delivered writes whose removal failed; the next cycle sends them again
  pub undeleted: usize,
  /// Writes still queued across both stores after the cycle
  pub remaining: usize,
  /// The cycle was skipped because the network is down
  pub offline: bool,
}

pub struct Replayer {
  store: Arc<LocalStore>,
  sources: Vec<Box<dyn MutationSource>>,
  transport: Arc<dyn Transport>,
  policy: CachePolicy,
  max_attempts: Option<u32>,
  running: Mutex<()>,
}

impl Replayer {
  pub fn new(
    store: Arc<LocalStore>,
    legacy: Arc<LegacyStore>,
    transport: Arc<dyn Transport>,
    policy: CachePolicy,
    max_attempts: Option<u32>,
  ) -> Self {
    let sources: Vec<Box<dyn MutationSource>> = vec![
      Box::new(OutboxSource::new(Arc::clone(&store))),
      Box::new(LegacySource::new(legacy)),
    ];

    Self {
      store,
      sources,
      transport,
      policy,
      max_attempts,
      running: Mutex::new(()),
    }
  }

  /// Queued writes across every source.
  pub fn pending_total(&self) -> usize {
    self.sources.iter().map(|s| s.count()).sum()
  }

  /// Run one replay cycle. Returns `None` if a cycle is already running.
  pub async fn run_cycle(&self) -> Option<ReplayReport> {
    let Ok(_guard) = self.running.try_lock() else {
      debug!("Replay already in progress, coalescing trigger");
      return None;
    };

    if !self.transport.is_online().await {
      info!("Still offline, skipping replay");
      return Some(ReplayReport {
        remaining: self.pending_total(),
        offline: true,
        ..ReplayReport::default()
      });
    }

    let mut report = ReplayReport::default();
    for source in &self.sources {
      self.drain(source.as_ref(), &mut report).await;
    }
    report.remaining = self.pending_total();

    info!(
      delivered = report.delivered,
      rejected = report.rejected,
      deferred = report.deferred,
      discarded = report.discarded,
      undeleted = report.undeleted,
      remaining = report.remaining,
      "Replay cycle finished"
    );
    Some(report)
  }

  async fn drain(&self, source: &dyn MutationSource, report: &mut ReplayReport) {
    for item in source.replayable() {
      let path = item.request.path();

      if self.policy.is_auth_path(&path) {
        warn!(source = source.name(), id = item.id, %path, "Discarding queued auth request");
        source.complete(item.id);
        report.discarded += 1;
        continue;
      }

      let mut request = item.request;
      if let Some(key) = item.idempotency_key {
        request
          .headers
          .entry(IDEMPOTENCY_HEADER.to_string())
          .or_insert(key);
      }

      let result = self.transport.send(&request).await;
      match ReplayOutcome::classify(&result) {
        ReplayOutcome::Delivered => {
          // Delete before invalidating: a crash in between may leave a
          // stale cache entry but never replays the write twice.
          if !source.complete(item.id) {
            error!(
              source = source.name(),
              id = item.id,
              %path,
              "Delivered mutation could not be removed, it will be replayed again"
            );
            report.undeleted += 1;
          }
          invalidation::invalidate(&self.store, &path);
          report.delivered += 1;
          debug!(source = source.name(), id = item.id, %path, "Replayed mutation");
        }
        ReplayOutcome::Rejected(status) => {
          if !source.complete(item.id) {
            error!(source = source.name(), id = item.id, %path, status, "Rejected mutation could not be removed");
          }
          report.rejected += 1;
          warn!(source = source.name(), id = item.id, %path, status, "Server rejected queued mutation, dropping it");
        }
        ReplayOutcome::Deferred => {
          report.deferred += 1;
          match &result {
            Ok(response) => {
              warn!(source = source.name(), id = item.id, %path, status = response.status, "Replay failed, will retry")
            }
            Err(e) => {
              debug!(source = source.name(), id = item.id, %path, error = %e, "Replay failed, will retry")
            }
          }
          self.defer(source, item.id, report);
        }
      }
    }
  }

  fn defer(&self, source: &dyn MutationSource, id: i64, report: &mut ReplayReport) {
    let Some(attempts) = source.defer(id) else {
      return;
    };
    if let Some(max) = self.max_attempts {
      if attempts >= max {
        error!(source = source.name(), id, attempts, "Giving up on mutation after too many attempts");
        source.complete(id);
        report.dropped += 1;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::http::RequestDescriptor;
  use crate::legacy::tests::seed_legacy;
  use crate::store::{CacheEntry, NewMutation};
  use crate::transport::fake::FakeTransport;
  use chrono::{Duration, Utc};
  use pretty_assertions::assert_eq;
  use serde_json::json;
  use tempfile::TempDir;

  struct Harness {
    _dir: TempDir,
    store: Arc<LocalStore>,
    transport: Arc<FakeTransport>,
    replayer: Replayer,
  }

  fn harness_with(max_attempts: Option<u32>, legacy_records: &[&str]) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = Config::with_upstream("https://api.example.org").unwrap();
    let store = Arc::new(LocalStore::open(&dir.path().join("outpost.db")));
    let legacy_path = dir.path().join("legacy.db");
    if !legacy_records.is_empty() {
      seed_legacy(&legacy_path, legacy_records);
    }
    let legacy = Arc::new(LegacyStore::open(&legacy_path, &config));
    let transport = Arc::new(FakeTransport::new());
    let replayer = Replayer::new(
      Arc::clone(&store),
      legacy,
      transport.clone(),
      CachePolicy::from_config(&config),
      max_attempts,
    );
    Harness {
      _dir: dir,
      store,
      transport,
      replayer,
    }
  }

  #[tokio::test]
  async fn test_failed_removal_after_delivery_is_reported() {
    use crate::store::local::tests::DenyingStorage;
    use crate::store::SqliteStorage;

    let dir = TempDir::new().unwrap();
    let config = Config::with_upstream("https://api.example.org").unwrap();
    let inner = SqliteStorage::open(&dir.path().join("outpost.db")).unwrap();
    // enqueue and the pending read succeed; the delete is denied
    let store = Arc::new(LocalStore::with_backend(Box::new(DenyingStorage::new(inner, 2))));
    enqueue(&store, "/api/v1/points");

    let transport = Arc::new(FakeTransport::new());
    let replayer = Replayer::new(
      Arc::clone(&store),
      Arc::new(LegacyStore::absent(&config)),
      transport.clone(),
      CachePolicy::from_config(&config),
      None,
    );

    let report = replayer.run_cycle().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.undeleted, 1);
    assert_eq!(called_paths(&transport), vec!["/api/v1/points"]);
  }

  fn harness() -> Harness {
    harness_with(None, &[])
  }

  fn enqueue(store: &LocalStore, path: &str) -> i64 {
    store
      .enqueue(&NewMutation {
        request: RequestDescriptor::new("POST", format!("https://api.example.org{}", path))
          .with_body("{}"),
        timestamp: Utc::now(),
        idempotency_key: format!("key{}", path.replace('/', "-")),
      })
      .unwrap()
  }

  fn called_paths(transport: &FakeTransport) -> Vec<String> {
    transport.calls().iter().map(|r| r.path()).collect()
  }

  #[test]
  fn test_classify() {
    let response = |status| {
      Ok(UpstreamResponse {
        status,
        headers: Default::default(),
        body: Vec::new(),
      })
    };
    assert_eq!(ReplayOutcome::classify(&response(201)), ReplayOutcome::Delivered);
    assert_eq!(ReplayOutcome::classify(&response(404)), ReplayOutcome::Rejected(404));
    assert_eq!(ReplayOutcome::classify(&response(503)), ReplayOutcome::Deferred);
    assert_eq!(
      ReplayOutcome::classify(&Err(color_eyre::eyre::eyre!("down"))),
      ReplayOutcome::Deferred
    );
  }

  #[tokio::test]
  async fn test_replays_in_fifo_order() {
    let h = harness();
    for path in ["/api/v1/a", "/api/v1/b", "/api/v1/c"] {
      enqueue(&h.store, path);
    }

    let report = h.replayer.run_cycle().await.unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(
      called_paths(&h.transport),
      vec!["/api/v1/a", "/api/v1/b", "/api/v1/c"]
    );
  }

  #[tokio::test]
  async fn test_client_error_is_dropped_for_good() {
    let h = harness();
    enqueue(&h.store, "/api/v1/points/99");
    h.transport.respond("/api/v1/points/99", 404, "{}");

    let report = h.replayer.run_cycle().await.unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(h.store.pending_count(), 0);

    h.transport.clear_calls();
    h.replayer.run_cycle().await.unwrap();
    assert!(h.transport.calls().is_empty());
  }

  #[tokio::test]
  async fn test_server_error_defers_without_blocking_later_writes() {
    let h = harness();
    enqueue(&h.store, "/api/v1/a");
    enqueue(&h.store, "/api/v1/b");
    h.transport.respond("/api/v1/a", 500, "{}");

    let report = h.replayer.run_cycle().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 1);

    let left = h.store.pending();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].request.path(), "/api/v1/a");
    assert_eq!(left[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_offline_cycle_makes_no_progress() {
    let h = harness();
    enqueue(&h.store, "/api/v1/a");
    h.transport.set_offline(true);

    let report = h.replayer.run_cycle().await.unwrap();
    assert!(report.offline);
    assert_eq!(report.remaining, 1);
    assert_eq!(h.store.pending()[0].attempts, 0);
  }

  #[tokio::test]
  async fn test_auth_requests_are_discarded_unsent() {
    let h = harness();
    enqueue(&h.store, "/api/auth/refresh");
    enqueue(&h.store, "/api/v1/a");

    let report = h.replayer.run_cycle().await.unwrap();
    assert_eq!(report.discarded, 1);
    assert_eq!(called_paths(&h.transport), vec!["/api/v1/a"]);
    assert_eq!(h.store.pending_count(), 0);
  }

  #[tokio::test]
  async fn test_success_invalidates_related_cache() {
    let h = harness();
    let expires_at = Utc::now() + Duration::hours(1);
    for key in ["/api/v1/attendance?date=today", "/api/v1/config"] {
      h.store.put_cached(&CacheEntry {
        key: key.to_string(),
        payload: json!({}),
        expires_at,
      });
    }
    enqueue(&h.store, "/api/v1/attendance");

    h.replayer.run_cycle().await.unwrap();
    assert_eq!(h.store.cache_keys(), vec!["/api/v1/config"]);
  }

  #[tokio::test]
  async fn test_sends_idempotency_key() {
    let h = harness();
    enqueue(&h.store, "/api/v1/a");

    h.replayer.run_cycle().await.unwrap();
    let calls = h.transport.calls();
    assert_eq!(
      calls[0].headers.get(IDEMPOTENCY_HEADER).map(String::as_str),
      Some("key-api-v1-a")
    );
  }

  #[tokio::test]
  async fn test_attempt_ceiling_drops_mutation() {
    let h = harness_with(Some(2), &[]);
    enqueue(&h.store, "/api/v1/a");
    h.transport.respond("/api/v1/a", 502, "{}");

    let first = h.replayer.run_cycle().await.unwrap();
    assert_eq!(first.dropped, 0);
    let second = h.replayer.run_cycle().await.unwrap();
    assert_eq!(second.dropped, 1);
    assert_eq!(h.store.pending_count(), 0);
  }

  #[tokio::test]
  async fn test_legacy_records_replay_after_outbox() {
    let h = harness_with(
      None,
      &[r#"{"data":{"url":"/api/v1/legacy-points","method":"POST","body":{"p":1}}}"#],
    );
    enqueue(&h.store, "/api/v1/current");
    assert_eq!(h.replayer.pending_total(), 2);

    let report = h.replayer.run_cycle().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(
      called_paths(&h.transport),
      vec!["/api/v1/current", "/api/v1/legacy-points"]
    );
    assert_eq!(h.replayer.pending_total(), 0);
  }

  #[tokio::test]
  async fn test_failed_legacy_record_stays() {
    let h = harness_with(None, &[r#"{"action":"saveAttendance","data":{}}"#]);
    h.transport.respond("/api/saveAttendance", 503, "{}");

    let report = h.replayer.run_cycle().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.remaining, 1);
  }

  #[tokio::test]
  async fn test_overlapping_cycles_are_coalesced() {
    let h = harness();
    enqueue(&h.store, "/api/v1/a");
    h.transport.set_delay(std::time::Duration::from_millis(50));

    let (first, second) = tokio::join!(h.replayer.run_cycle(), async {
      tokio::task::yield_now().await;
      h.replayer.run_cycle().await
    });

    assert_eq!(first.unwrap().delivered, 1);
    assert!(second.is_none());
    assert_eq!(h.transport.calls().len(), 1);
  }
}

//! Adapters presenting each outbox schema as a uniform list of replayable requests.

use std::sync::Arc;

use crate::http::RequestDescriptor;
use crate::legacy::LegacyStore;
use crate::store::LocalStore;

/// One queued write, whichever store it lives in.
#[derive(Debug, Clone)]
pub struct Replayable {
  pub id: i64,
  pub request: RequestDescriptor,
  pub idempotency_key: Option<String>,
}

/// A store the replayer can drain.
pub trait MutationSource: Send + Sync {
  fn name(&self) -> &'static str;

  /// Queued writes, oldest first.
  fn replayable(&self) -> Vec<Replayable>;

  /// Remove a write the server has answered for good.
  fn complete(&self, id: i64) -> bool;

  /// Note a failed attempt. Returns the attempt count, or `None` when this
  /// source does not track attempts.
  fn defer(&self, id: i64) -> Option<u32>;

  fn count(&self) -> usize;
}

/// The current-generation outbox.
pub struct OutboxSource {
  store: Arc<LocalStore>,
}

impl OutboxSource {
  pub fn new(store: Arc<LocalStore>) -> Self {
    Self { store }
  }
}

impl MutationSource for OutboxSource {
  fn name(&self) -> &'static str {
    "outbox"
  }

  fn replayable(&self) -> Vec<Replayable> {
    self
      .store
      .pending()
      .into_iter()
      .map(|m| Replayable {
        id: m.id,
        request: m.request,
        idempotency_key: Some(m.idempotency_key),
      })
      .collect()
  }

  fn complete(&self, id: i64) -> bool {
    self.store.delete_pending(id)
  }

  fn defer(&self, id: i64) -> Option<u32> {
    Some(self.store.record_attempt(id))
  }

  fn count(&self) -> usize {
    self.store.pending_count()
  }
}

/// Records left behind by the previous client generation.
pub struct LegacySource {
  legacy: Arc<LegacyStore>,
}

impl LegacySource {
  pub fn new(legacy: Arc<LegacyStore>) -> Self {
    Self { legacy }
  }
}

impl MutationSource for LegacySource {
  fn name(&self) -> &'static str {
    "legacy"
  }

  fn replayable(&self) -> Vec<Replayable> {
    self
      .legacy
      .requests()
      .into_iter()
      .map(|(id, request)| Replayable {
        id,
        request,
        idempotency_key: None,
      })
      .collect()
  }

  fn complete(&self, id: i64) -> bool {
    self.legacy.delete(id)
  }

  fn defer(&self, _id: i64) -> Option<u32> {
    None // legacy records carry no attempt counter
  }

  fn count(&self) -> usize {
    self.legacy.count()
  }
}

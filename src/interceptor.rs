//! Fetch handling: the agent's entry point for every page request.
//!
//! - cacheable GET: network first; store on 2xx JSON, fall back to a live
//!   cache entry on failure or non-2xx
//! - write to an auth endpoint: straight to the network, nothing stored
//! - any other write: network first; purge related cache keys on 2xx,
//!   queue it and answer 202 when the network is unreachable
//!
//! Every path resolves to a response; errors never reach the page.
//!
//! A 202 always means the write is persisted in the outbox. When the store is
//! degraded and the network is down, the write cannot be kept and the page
//! gets a 503 with `queued: false` instead.

use tracing::{debug, warn};

use crate::agent::{Agent, Lifecycle};
use crate::http::{AgentResponse, RequestDescriptor};
use crate::invalidation;
use crate::policy::CachePolicy;
use crate::store::CacheEntry;
use crate::sync::OUTBOX_SYNC_TAG;

impl Agent {
  pub async fn handle_fetch(&self, request: RequestDescriptor) -> AgentResponse {
    if self.lifecycle() != Lifecycle::Active {
      return self.passthrough(&request).await;
    }

    if request.is_get() {
      if self.policy.is_cacheable(&request) {
        return self.cached_get(&request).await;
      }
      return self.passthrough(&request).await;
    }

    if self.policy.is_auth_path(&request.path()) {
      return self.passthrough(&request).await;
    }

    self.mutation(request).await
  }

  /// Send without touching the cache or the outbox.
  async fn passthrough(&self, request: &RequestDescriptor) -> AgentResponse {
    match self.transport.send(request).await {
      Ok(response) => AgentResponse::from_network(response),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Passthrough request failed");
        AgentResponse::offline_no_data()
      }
    }
  }

  async fn cached_get(&self, request: &RequestDescriptor) -> AgentResponse {
    let key = CachePolicy::cache_key(&request.url);

    match self.transport.send(request).await {
      Ok(response) if response.is_success() => {
        match response.json() {
          Some(payload) => {
            let ttl = self
              .policy
              .cache_duration_for(&request.path(), self.camp_mode());
            self.store.put_cached(&CacheEntry {
              key,
              payload,
              expires_at: self.now() + ttl,
            });
          }
          None => debug!(%key, "Response is not JSON, not caching"),
        }
        AgentResponse::from_network(response)
      }
      Ok(response) => match self.store.get_cached(&key, self.now()) {
        Some(entry) => {
          debug!(%key, status = response.status, "Server error, serving cached copy");
          AgentResponse::from_cache(entry.payload)
        }
        None => AgentResponse::from_network(response),
      },
      Err(e) => match self.store.get_cached(&key, self.now()) {
        Some(entry) => {
          debug!(%key, error = %e, "Offline, serving cached copy");
          AgentResponse::from_cache(entry.payload)
        }
        None => {
          warn!(%key, error = %e, "Offline with nothing cached");
          AgentResponse::offline_no_data()
        }
      },
    }
  }

  async fn mutation(&self, request: RequestDescriptor) -> AgentResponse {
    match self.transport.send(&request).await {
      Ok(response) => {
        if response.is_success() {
          invalidation::invalidate(&self.store, &request.path());
        }
        AgentResponse::from_network(response)
      }
      Err(e) => {
        warn!(url = %request.url, method = %request.method, error = %e, "Write failed, queueing it");
        match self.enqueue(request) {
          Some(_) => {
            self.sync_registry().register(OUTBOX_SYNC_TAG);
            AgentResponse::queued()
          }
          None => AgentResponse::offline_not_queued(),
        }
      }
    }
  }
}

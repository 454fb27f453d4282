//! Reconnect signalling: sync tag registration and the connectivity watcher.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::agent::{Agent, AgentEvent};

/// Tag registered whenever a write lands in the outbox.
pub const OUTBOX_SYNC_TAG: &str = "outbox-replay";

/// Tags waiting for the network to come back.
#[derive(Debug, Default)]
pub struct SyncRegistry {
  tags: Mutex<BTreeSet<String>>,
}

impl SyncRegistry {
  pub fn register(&self, tag: &str) {
    if let Ok(mut tags) = self.tags.lock() {
      tags.insert(tag.to_string());
    }
  }

  pub fn is_registered(&self, tag: &str) -> bool {
    self
      .tags
      .lock()
      .map(|tags| tags.contains(tag))
      .unwrap_or(false)
  }

  pub fn is_empty(&self) -> bool {
    self.tags.lock().map(|tags| tags.is_empty()).unwrap_or(true)
  }

  /// Remove and return every registered tag.
  pub fn take_all(&self) -> Vec<String> {
    match self.tags.lock() {
      Ok(mut tags) => std::mem::take(&mut *tags).into_iter().collect(),
      Err(_) => Vec::new(),
    }
  }
}

/// Probe connectivity and fire sync events, forever.
///
/// Registered tags are fired (and cleared) on the first probe that finds the
/// network up. With `periodic` set, a periodic sync also fires on that cadence.
pub async fn watch_connectivity(agent: Arc<Agent>, probe: Duration, periodic: Option<Duration>) {
  let mut probe_tick = interval(probe);
  probe_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

  let mut periodic_tick = periodic.map(|p| {
    let mut tick = interval(p);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
  });

  info!(probe_secs = probe.as_secs(), "Connectivity watcher started");

  loop {
    tokio::select! {
      _ = probe_tick.tick() => {
        if agent.sync_registry().is_empty() {
          continue;
        }
        if !agent.is_online().await {
          debug!("Sync pending but still offline");
          continue;
        }
        for tag in agent.sync_registry().take_all() {
          agent.dispatch(AgentEvent::Sync(tag)).await;
        }
      }
      _ = async {
        match periodic_tick.as_mut() {
          Some(tick) => { tick.tick().await; }
          None => std::future::pending::<()>().await,
        }
      } => {
        agent.dispatch(AgentEvent::PeriodicSync).await;
      }
    }
  }
}

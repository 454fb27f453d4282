//! The background agent: shared state and event dispatch.


use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::{ClientMessage, ControlMessage, ControlReply};
use crate::http::{AgentResponse, RequestDescriptor};
use crate::legacy::LegacyStore;
use crate::policy::CachePolicy;
use crate::replay::{ReplayReport, Replayer};
use crate::store::{LocalStore, NewMutation};
use crate::sync::{SyncRegistry, OUTBOX_SYNC_TAG};
use crate::transport::Transport;

/// Where the agent is in its install/activate handover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Installing,
  /// Installed, not yet controlling pages
  Waiting,
  Active,
}

/// Process-wide mutable flags.
///
/// Both start at their defaults when the agent is built. `camp_mode` only
/// changes through `SET_CAMP_MODE`; `lifecycle` only through the install /
/// activate events and `SKIP_WAITING`. The degraded-storage flag lives on
/// [`LocalStore`] and only flips on a caught storage access error.
#[derive(Debug)]
pub struct AgentState {
  camp_mode: AtomicBool,
  lifecycle: Mutex<Lifecycle>,
}

impl Default for AgentState {
  fn default() -> Self {
    Self {
      camp_mode: AtomicBool::new(false),
      lifecycle: Mutex::new(Lifecycle::Installing),
    }
  }
}

/// Everything the runtime can hand to the agent.
#[derive(Debug, Clone)]
pub enum AgentEvent {
  Install,
  Activate,
  Fetch(RequestDescriptor),
  Message(ControlMessage),
  /// The network came back for a registered tag
  Sync(String),
  PeriodicSync,
  Push(Value),
}

/// What handling an event produced.
#[derive(Debug)]
pub enum EventOutcome {
  Done,
  Response(AgentResponse),
  Reply(Option<ControlReply>),
  /// `None` when the trigger was folded into a running cycle
  Replayed(Option<ReplayReport>),
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Agent {
  pub(crate) config: Config,
  pub(crate) state: AgentState,
  pub(crate) store: Arc<LocalStore>,
  pub(crate) policy: CachePolicy,
  pub(crate) transport: Arc<dyn Transport>,
  replayer: Replayer,
  sync: SyncRegistry,
  clients: broadcast::Sender<ClientMessage>,
  clock: Clock,
}

impl Agent {
  pub fn new(
    config: Config,
    store: LocalStore,
    legacy: LegacyStore,
    transport: Arc<dyn Transport>,
  ) -> Self {
    let store = Arc::new(store);
    let policy = CachePolicy::from_config(&config);
    let replayer = Replayer::new(
      Arc::clone(&store),
      Arc::new(legacy),
      Arc::clone(&transport),
      policy.clone(),
      config.sync.max_attempts,
    );
    let (clients, _) = broadcast::channel(64);

    Self {
      config,
      state: AgentState::default(),
      store,
      policy,
      transport,
      replayer,
      sync: SyncRegistry::default(),
      clients,
      clock: Box::new(Utc::now),
    }
  }

  /// Build an agent over the stores named in `config`.
  pub fn open(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
    let store = LocalStore::open(&config.store_path()?);
    let legacy = LegacyStore::open(&config.legacy_path()?, &config);
    Ok(Self::new(config, store, legacy, transport))
  }

  /// Replace the wall clock, for tests.
  #[cfg(test)]
  pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
    self.clock = Box::new(clock);
    self
  }

  pub(crate) fn now(&self) -> DateTime<Utc> {
    (self.clock)()
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn lifecycle(&self) -> Lifecycle {
    self
      .state
      .lifecycle
      .lock()
      .map(|l| *l)
      .unwrap_or(Lifecycle::Active)
  }

  fn set_lifecycle(&self, next: Lifecycle) {
    if let Ok(mut lifecycle) = self.state.lifecycle.lock() {
      *lifecycle = next;
    }
  }

  pub fn camp_mode(&self) -> bool {
    self.state.camp_mode.load(Ordering::SeqCst)
  }

  /// Writes waiting in the outbox and the legacy store.
  pub fn pending_total(&self) -> usize {
    self.replayer.pending_total()
  }

  pub fn sync_registry(&self) -> &SyncRegistry {
    &self.sync
  }

  pub async fn is_online(&self) -> bool {
    self.transport.is_online().await
  }

  /// Listen for broadcasts to foreground pages.
  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.clients.subscribe()
  }

  fn broadcast(&self, message: ClientMessage) {
    if self.clients.send(message).is_err() {
      debug!("No foreground pages connected, broadcast dropped");
    }
  }

  /// Route one event to its handler.
  pub async fn dispatch(&self, event: AgentEvent) -> EventOutcome {
    match event {
      AgentEvent::Install => {
        self.on_install();
        EventOutcome::Done
      }
      AgentEvent::Activate => {
        self.on_activate();
        EventOutcome::Done
      }
      AgentEvent::Fetch(request) => EventOutcome::Response(self.handle_fetch(request).await),
      AgentEvent::Message(message) => EventOutcome::Reply(self.handle_message(message).await),
      AgentEvent::Sync(tag) => {
        if tag == OUTBOX_SYNC_TAG {
          EventOutcome::Replayed(self.replay().await)
        } else {
          debug!(%tag, "Ignoring unknown sync tag");
          EventOutcome::Done
        }
      }
      AgentEvent::PeriodicSync => EventOutcome::Replayed(self.replay().await),
      AgentEvent::Push(payload) => {
        info!("Forwarding push payload to pages");
        self.broadcast(ClientMessage::Push { payload });
        EventOutcome::Done
      }
    }
  }

  fn on_install(&self) {
    info!(version = %self.config.version, "Agent installed, waiting to activate");
    self.set_lifecycle(Lifecycle::Waiting);
  }

  fn on_activate(&self) {
    let purged = self.store.purge_expired(self.now());
    self.set_lifecycle(Lifecycle::Active);
    info!(
      version = %self.config.version,
      purged,
      degraded = self.store.is_degraded(),
      "Agent active"
    );
  }

  async fn handle_message(&self, message: ControlMessage) -> Option<ControlReply> {
    match message {
      ControlMessage::SkipWaiting => {
        if self.lifecycle() != Lifecycle::Active {
          self.on_activate();
        }
        None
      }
      ControlMessage::GetVersion => Some(ControlReply::VersionInfo {
        version: self.config.version.clone(),
      }),
      ControlMessage::CheckUpdate => {
        self.broadcast(ClientMessage::UpdateAvailable {
          version: self.config.version.clone(),
        });
        None
      }
      ControlMessage::QueueMutation { mutation } => {
        let request = RequestDescriptor {
          url: self.config.upstream_url(&mutation.url),
          method: mutation.method.to_ascii_uppercase(),
          ..mutation
        };
        if self.enqueue(request).is_some() {
          self.sync.register(OUTBOX_SYNC_TAG);
        }
        None
      }
      ControlMessage::SetCampMode { enabled } => {
        self.state.camp_mode.store(enabled, Ordering::SeqCst);
        info!(enabled, "Camp mode changed");
        None
      }
      ControlMessage::GetPendingCount => Some(ControlReply::PendingCount {
        count: self.pending_total(),
      }),
      ControlMessage::GetOutboxCount => Some(ControlReply::OutboxCount {
        count: self.store.pending_count(),
      }),
      ControlMessage::SyncNow => Some(match self.replay().await {
        Some(report) => ControlReply::SyncResult(report),
        None => ControlReply::SyncBusy,
      }),
      ControlMessage::ClearCache => {
        let cleared = self.store.clear_cache();
        info!(cleared, "Read cache cleared");
        None
      }
    }
  }

  /// Run a replay cycle and tell the pages how it went.
  async fn replay(&self) -> Option<ReplayReport> {
    let report = self.replayer.run_cycle().await?;
    if report.remaining > 0 {
      self.sync.register(OUTBOX_SYNC_TAG);
    }
    self.broadcast(ClientMessage::SyncComplete(report.clone()));
    Some(report)
  }

  /// Persist a write to the outbox. Auth requests are refused outright.
  pub(crate) fn enqueue(&self, request: RequestDescriptor) -> Option<i64> {
    let path = request.path();
    if self.policy.is_auth_path(&path) {
      warn!(%path, "Refusing to queue an auth request");
      return None;
    }

    let timestamp = self.now();
    let idempotency_key = idempotency_key(&request, timestamp);
    let id = self.store.enqueue(&NewMutation {
      request,
      timestamp,
      idempotency_key,
    });

    match id {
      Some(id) => info!(id, %path, "Queued mutation for replay"),
      None => warn!(%path, "Could not persist mutation, it is lost"),
    }
    id
  }
}

/// Stable key identifying one enqueued write across replays.
fn idempotency_key(request: &RequestDescriptor, timestamp: DateTime<Utc>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_bytes());
  hasher.update(b"\n");
  hasher.update(request.url.as_bytes());
  hasher.update(b"\n");
  hasher.update(request.body.as_deref().unwrap_or_default().as_bytes());
  hasher.update(b"\n");
  hasher.update(timestamp.timestamp_millis().to_string().as_bytes());
  hex::encode(hasher.finalize())
}

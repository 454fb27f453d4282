//! Messages exchanged between foreground pages and the agent.
//!
//! Every message is a JSON object discriminated by its `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::RequestDescriptor;
use crate::replay::ReplayReport;

/// Page -> agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Become the active agent now instead of waiting for a handover
  SkipWaiting,
  GetVersion,
  /// Tell every connected page that this version is installed and waiting
  CheckUpdate,
  /// Put a request the page already saw fail straight into the outbox
  QueueMutation { mutation: RequestDescriptor },
  SetCampMode { enabled: bool },
  /// Outbox + legacy store
  GetPendingCount,
  /// Current outbox only
  GetOutboxCount,
  /// Run a replay cycle now
  SyncNow,
  ClearCache,
}

/// Agent -> the page that sent a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  VersionInfo { version: String },
  PendingCount { count: usize },
  OutboxCount { count: usize },
  SyncResult(ReplayReport),
  /// A replay cycle was already running; this trigger was folded into it
  SyncBusy,
}

/// Agent -> every connected page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  UpdateAvailable { version: String },
  SyncComplete(ReplayReport),
  /// A push payload, forwarded as-is
  Push { payload: Value },
}

//! Request and response types shared by the interceptor, the outbox and the transport.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Header carrying the replay idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Header set on responses served from the local cache.
pub const SOURCE_HEADER: &str = "x-outpost-source";

/// Header set on synthesized offline responses.
pub const OFFLINE_HEADER: &str = "x-outpost-offline";

/// A fully reconstructible HTTP request.
///
/// This is the unit that gets serialized into the outbox, so it only holds
/// owned, serde-friendly data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
  pub url: String,
  pub method: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default, deserialize_with = "deserialize_body")]
  pub body: Option<String>,
}

/// Accept a body either as a string or as inline JSON, which is re-encoded.
fn deserialize_body<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let value = Option::<Value>::deserialize(deserializer)?;
  Ok(match value {
    None | Some(Value::Null) => None,
    Some(Value::String(s)) => Some(s),
    Some(other) => Some(other.to_string()),
  })
}

impl RequestDescriptor {
  pub fn new(method: &str, url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: method.to_ascii_uppercase(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  /// Path component of the target URL (no query, no fragment).
  pub fn path(&self) -> String {
    match url::Url::parse(&self.url) {
      Ok(parsed) => parsed.path().to_string(),
      Err(_) => self
        .url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_string(),
    }
  }
}

/// What the network handed back for a request.
///
/// Any HTTP status is a successful transport call; only a transport failure
/// is reported as an error by [`crate::transport::Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl UpstreamResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_client_error(&self) -> bool {
    (400..500).contains(&self.status)
  }

  /// Parse the body as JSON, if it is JSON.
  pub fn json(&self) -> Option<Value> {
    serde_json::from_slice(&self.body).ok()
  }
}

/// Indicates where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Non-expired entry from the read cache
  Cache,
  /// Built locally by the agent (queued / offline)
  Synthesized,
}

/// The response the agent resolves a fetch with.
#[derive(Debug, Clone)]
pub struct AgentResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl AgentResponse {
  pub fn from_network(upstream: UpstreamResponse) -> Self {
    Self {
      status: upstream.status,
      headers: upstream.headers,
      body: upstream.body,
      source: ResponseSource::Network,
    }
  }

  /// Serve a cached payload, tagged so the page can tell it is not fresh.
  pub fn from_cache(mut payload: Value) -> Self {
    if let Value::Object(map) = &mut payload {
      map.insert("_fromCache".to_string(), Value::Bool(true));
    }
    let mut response = Self::json(200, &payload, ResponseSource::Cache);
    response
      .headers
      .insert(SOURCE_HEADER.to_string(), "cache".to_string());
    response
  }

  /// The optimistic reply for a mutation that went into the outbox.
  pub fn queued() -> Self {
    let body = json!({
      "success": true,
      "queued": true,
      "offline": true,
      "message": "Request queued; it will be sent when the connection returns",
    });
    let mut response = Self::json(202, &body, ResponseSource::Synthesized);
    response
      .headers
      .insert(OFFLINE_HEADER.to_string(), "true".to_string());
    response
  }

  /// Network is gone and nothing usable is cached.
  pub fn offline_no_data() -> Self {
    let body = json!({
      "success": false,
      "offline": true,
      "message": "Offline and no cached data is available",
    });
    let mut response = Self::json(503, &body, ResponseSource::Synthesized);
    response
      .headers
      .insert(OFFLINE_HEADER.to_string(), "true".to_string());
    response
  }

  /// Network is gone and the write could not be persisted either.
  pub fn offline_not_queued() -> Self {
    let body = json!({
      "success": false,
      "offline": true,
      "queued": false,
      "message": "Offline and the request could not be saved for later",
    });
    let mut response = Self::json(503, &body, ResponseSource::Synthesized);
    response
      .headers
      .insert(OFFLINE_HEADER.to_string(), "true".to_string());
    response
  }

  fn json(status: u16, body: &Value, source: ResponseSource) -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Self {
      status,
      headers,
      body: body.to_string().into_bytes(),
      source,
    }
  }

  pub fn json_body(&self) -> Option<Value> {
    serde_json::from_slice(&self.body).ok()
  }
}

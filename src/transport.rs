//! Outbound network access.
//!
//! The agent only ever talks to the network through [`Transport`]. An `Err`
//! from [`Transport::send`] means the request never produced an HTTP
//! response (no route, DNS failure, connection reset); every HTTP status,
//! including 4xx and 5xx, comes back as `Ok`.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::collections::BTreeMap;

use crate::http::{RequestDescriptor, UpstreamResponse};

#[async_trait]
pub trait Transport: Send + Sync {
  /// Send a request and return whatever the server answered.
  async fn send(&self, request: &RequestDescriptor) -> Result<UpstreamResponse>;

  /// Cheap connectivity check used before a replay cycle.
  async fn is_online(&self) -> bool;
}

/// reqwest-backed transport against the real upstream API.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  probe_url: String,
}

impl HttpTransport {
  pub fn new(upstream: &str) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("outpost/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      probe_url: upstream.to_string(),
    })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &RequestDescriptor) -> Result<UpstreamResponse> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid HTTP method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, &request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", request.url, e))?
      .to_vec();

    Ok(UpstreamResponse {
      status,
      headers,
      body,
    })
  }

  async fn is_online(&self) -> bool {
    // Any HTTP answer, even an error status, proves the network is there.
    self.client.head(&self.probe_url).send().await.is_ok()
  }
}

#[cfg(test)]
pub mod fake {
  //! Scriptable in-memory transport for tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  /// Records every request it sees and answers from a per-path script.
  ///
  /// Paths without a scripted status answer 200 with an echo body.
  #[derive(Default)]
  pub struct FakeTransport {
    offline: AtomicBool,
    delay: Mutex<Option<std::time::Duration>>,
    statuses: Mutex<HashMap<String, u16>>,
    bodies: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<RequestDescriptor>>,
  }

  impl FakeTransport {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every send take this long before answering.
    pub fn set_delay(&self, delay: std::time::Duration) {
      *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn respond(&self, path: &str, status: u16, body: &str) {
      self
        .statuses
        .lock()
        .unwrap()
        .insert(path.to_string(), status);
      self
        .bodies
        .lock()
        .unwrap()
        .insert(path.to_string(), body.to_string());
    }

    pub fn calls(&self) -> Vec<RequestDescriptor> {
      self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
      self.calls.lock().unwrap().clear();
    }
  }

  #[async_trait]
  impl Transport for FakeTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<UpstreamResponse> {
      if self.offline.load(Ordering::SeqCst) {
        return Err(eyre!("network unreachable"));
      }
      self.calls.lock().unwrap().push(request.clone());

      let delay = *self.delay.lock().unwrap();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }

      let path = request.path();
      let status = self
        .statuses
        .lock()
        .unwrap()
        .get(&path)
        .copied()
        .unwrap_or(200);
      let body = self
        .bodies
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .unwrap_or_else(|| format!(r#"{{"path":"{}"}}"#, path));

      Ok(UpstreamResponse {
        status,
        headers: BTreeMap::new(),
        body: body.into_bytes(),
      })
    }

    async fn is_online(&self) -> bool {
      !self.offline.load(Ordering::SeqCst)
    }
  }
}

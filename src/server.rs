//! Loopback HTTP surface for foreground pages.
//!
//! - `POST /_outpost/messages`: control messages, JSON reply or 204
//! - `GET /_outpost/events`: broadcasts to pages as server-sent events
//! - anything else: proxied through the interceptor to the upstream API

use axum::{
  body::{Body, Bytes},
  extract::State,
  http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
  response::{
    sse::{Event, KeepAlive, Sse},
    IntoResponse, Response,
  },
  routing::{get, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::agent::{Agent, AgentEvent, EventOutcome};
use crate::control::ControlMessage;
use crate::http::{AgentResponse, RequestDescriptor};

/// Headers that describe one hop, not the request itself. Encoding is
/// negotiated by the outbound client on its own.
const HOP_HEADERS: &[&str] = &[
  "host",
  "accept-encoding",
  "connection",
  "content-length",
  "content-encoding",
  "transfer-encoding",
  "keep-alive",
];

pub fn router(agent: Arc<Agent>) -> Router {
  Router::new()
    .route("/_outpost/messages", post(message))
    .route("/_outpost/events", get(events))
    .fallback(proxy)
    .with_state(agent)
}

pub async fn serve(agent: Arc<Agent>, listen: &str) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(%listen, "Listening for pages");

  axum::serve(listener, router(agent))
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

async fn message(State(agent): State<Arc<Agent>>, Json(message): Json<ControlMessage>) -> Response {
  match agent.dispatch(AgentEvent::Message(message)).await {
    EventOutcome::Reply(Some(reply)) => Json(reply).into_response(),
    _ => StatusCode::NO_CONTENT.into_response(),
  }
}

async fn events(
  State(agent): State<Arc<Agent>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
  let stream = stream::unfold(agent.subscribe(), |mut rx| async move {
    loop {
      match rx.recv().await {
        Ok(message) => return Some((Event::default().json_data(&message), rx)),
        Err(RecvError::Lagged(skipped)) => {
          warn!(skipped, "Page fell behind, broadcasts dropped");
        }
        Err(RecvError::Closed) => return None,
      }
    }
  });

  Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn proxy(
  State(agent): State<Arc<Agent>>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> Response {
  let path_and_query = uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");

  let mut request = RequestDescriptor::new(method.as_str(), agent.config().upstream_url(path_and_query));
  for (name, value) in &headers {
    if HOP_HEADERS.contains(&name.as_str()) {
      continue;
    }
    if let Ok(value) = value.to_str() {
      request = request.with_header(name.as_str(), value);
    }
  }
  // Bodies are stored as text in the outbox; binary uploads are refused
  // rather than rewritten.
  if !body.is_empty() {
    match String::from_utf8(body.to_vec()) {
      Ok(text) => request = request.with_body(text),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Refusing request with non-UTF-8 body");
        return (StatusCode::BAD_REQUEST, "Request body must be UTF-8 text").into_response();
      }
    }
  }

  match agent.dispatch(AgentEvent::Fetch(request)).await {
    EventOutcome::Response(response) => into_response(response),
    _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
  }
}

fn into_response(response: AgentResponse) -> Response {
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut out = Response::new(Body::from(response.body));
  *out.status_mut() = status;

  for (name, value) in &response.headers {
    if HOP_HEADERS.contains(&name.as_str()) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      out.headers_mut().insert(name, value);
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::http::SOURCE_HEADER;
  use crate::transport::fake::FakeTransport;
  use pretty_assertions::assert_eq;
  use serde_json::{json, Value};
  use tempfile::TempDir;

  async fn spawn_agent() -> (TempDir, Arc<FakeTransport>, String) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_upstream("https://api.example.org").unwrap();
    config.data_dir = Some(dir.path().to_path_buf());
    config.version = "3.1.0".to_string();

    let transport = Arc::new(FakeTransport::new());
    let agent = Arc::new(Agent::open(config, transport.clone()).unwrap());
    agent.dispatch(AgentEvent::Install).await;
    agent.dispatch(AgentEvent::Activate).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
      axum::serve(listener, router(agent)).await.unwrap();
    });
    (dir, transport, base)
  }

  #[tokio::test]
  async fn test_message_endpoint_replies_or_204() {
    let (_dir, _transport, base) = spawn_agent().await;
    let client = reqwest::Client::new();

    let reply = client
      .post(format!("{}/_outpost/messages", base))
      .header("content-type", "application/json")
      .body(json!({"type": "GET_VERSION"}).to_string())
      .send()
      .await
      .unwrap();
    assert_eq!(reply.status().as_u16(), 200);
    let body: Value = serde_json::from_slice(&reply.bytes().await.unwrap()).unwrap();
    assert_eq!(body, json!({"type": "VERSION_INFO", "version": "3.1.0"}));

    let silent = client
      .post(format!("{}/_outpost/messages", base))
      .header("content-type", "application/json")
      .body(json!({"type": "SET_CAMP_MODE", "enabled": true}).to_string())
      .send()
      .await
      .unwrap();
    assert_eq!(silent.status().as_u16(), 204);
  }

  #[tokio::test]
  async fn test_proxy_forwards_and_serves_cache() {
    let (_dir, transport, base) = spawn_agent().await;
    let client = reqwest::Client::new();

    let online = client
      .get(format!("{}/api/v1/groups?unit=3", base))
      .send()
      .await
      .unwrap();
    assert_eq!(online.status().as_u16(), 200);
    let calls = transport.calls();
    assert_eq!(calls[0].url, "https://api.example.org/api/v1/groups?unit=3");
    assert!(!calls[0].headers.contains_key("host"));

    transport.set_offline(true);
    let cached = client
      .get(format!("{}/api/v1/groups?unit=3", base))
      .send()
      .await
      .unwrap();
    assert_eq!(cached.status().as_u16(), 200);
    assert_eq!(cached.headers().get(SOURCE_HEADER).unwrap(), "cache");
    let body: Value = serde_json::from_slice(&cached.bytes().await.unwrap()).unwrap();
    assert_eq!(body["_fromCache"], true);

    let queued = client
      .post(format!("{}/api/v1/points", base))
      .body(r#"{"points":5}"#)
      .send()
      .await
      .unwrap();
    assert_eq!(queued.status().as_u16(), 202);
  }

  #[tokio::test]
  async fn test_binary_body_is_refused_not_rewritten() {
    let (_dir, transport, base) = spawn_agent().await;
    let client = reqwest::Client::new();

    let response = client
      .post(format!("{}/api/v1/forms", base))
      .body(vec![0xff, 0xfe, 0x00, 0x81])
      .send()
      .await
      .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    assert!(transport.calls().is_empty());

    transport.set_offline(true);
    let response = client
      .put(format!("{}/api/v1/forms/2", base))
      .body(vec![0xc3, 0x28])
      .send()
      .await
      .unwrap();
    assert_eq!(response.status().as_u16(), 400);
  }
}

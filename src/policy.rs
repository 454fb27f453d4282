//! Cache policy: which requests are cacheable, under which key, for how long.

use chrono::Duration;

use crate::config::Config;
use crate::http::RequestDescriptor;

/// Cache duration policy in force for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlPolicy {
  Standard,
  /// Extended duration while camp mode is on, for whitelisted resources
  Camp,
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
  standard_ttl: Duration,
  camp_ttl: Duration,
  camp_keywords: Vec<String>,
  cacheable_prefixes: Vec<String>,
  auth_prefixes: Vec<String>,
}

impl CachePolicy {
  pub fn from_config(config: &Config) -> Self {
    Self {
      standard_ttl: Duration::hours(config.cache.standard_ttl_hours),
      camp_ttl: Duration::days(config.cache.camp_ttl_days),
      camp_keywords: config.cache.camp_keywords.clone(),
      cacheable_prefixes: config.cache.cacheable_prefixes.clone(),
      auth_prefixes: config.auth_paths.clone(),
    }
  }

  /// Canonical identity of a GET request: path plus query, no origin, no fragment.
  pub fn cache_key(url: &str) -> String {
    match url::Url::parse(url) {
      Ok(parsed) => match parsed.query() {
        Some(query) if !query.is_empty() => format!("{}?{}", parsed.path(), query),
        _ => parsed.path().to_string(),
      },
      Err(_) => url.split('#').next().unwrap_or_default().to_string(),
    }
  }

  /// Authentication endpoints are never cached and never queued.
  pub fn is_auth_path(&self, path: &str) -> bool {
    self
      .auth_prefixes
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
  }

  pub fn is_cacheable(&self, request: &RequestDescriptor) -> bool {
    if !request.is_get() {
      return false;
    }
    let path = request.path();
    !self.is_auth_path(&path)
      && self
        .cacheable_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
  }

  pub fn ttl_policy(&self, path: &str, camp_mode: bool) -> TtlPolicy {
    let path = path.to_lowercase();
    if camp_mode && self.camp_keywords.iter().any(|k| path.contains(k.as_str())) {
      TtlPolicy::Camp
    } else {
      TtlPolicy::Standard
    }
  }

  pub fn cache_duration_for(&self, path: &str, camp_mode: bool) -> Duration {
    match self.ttl_policy(path, camp_mode) {
      TtlPolicy::Standard => self.standard_ttl,
      TtlPolicy::Camp => self.camp_ttl,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy() -> CachePolicy {
    CachePolicy::from_config(&Config::with_upstream("https://api.example.org").unwrap())
  }

  #[test]
  fn test_cache_key_drops_origin_and_fragment() {
    assert_eq!(
      CachePolicy::cache_key("https://api.example.org/api/v1/participants?group=3#x"),
      "/api/v1/participants?group=3"
    );
    assert_eq!(
      CachePolicy::cache_key("https://api.example.org/api/v1/groups"),
      "/api/v1/groups"
    );
    assert_eq!(CachePolicy::cache_key("/api/v1/groups#frag"), "/api/v1/groups");
  }

  #[test]
  fn test_camp_mode_only_widens_whitelisted_paths() {
    let policy = policy();
    assert_eq!(
      policy.cache_duration_for("/api/v1/groups", false),
      Duration::hours(24)
    );
    assert_eq!(
      policy.cache_duration_for("/api/v1/groups", true),
      Duration::days(7)
    );
    assert_eq!(
      policy.cache_duration_for("/api/v1/config", true),
      Duration::hours(24)
    );
  }

  #[test]
  fn test_cacheable_excludes_auth_and_writes() {
    let policy = policy();
    let get = RequestDescriptor::new("GET", "https://api.example.org/api/v1/groups");
    let post = RequestDescriptor::new("POST", "https://api.example.org/api/v1/groups");
    let auth = RequestDescriptor::new("GET", "https://api.example.org/api/auth/session");
    let static_asset = RequestDescriptor::new("GET", "https://api.example.org/index.html");

    assert!(policy.is_cacheable(&get));
    assert!(!policy.is_cacheable(&post));
    assert!(!policy.is_cacheable(&auth));
    assert!(!policy.is_cacheable(&static_asset));
  }

  #[test]
  fn test_auth_paths() {
    let policy = policy();
    assert!(policy.is_auth_path("/api/login"));
    assert!(policy.is_auth_path("/api/auth/refresh"));
    assert!(!policy.is_auth_path("/api/v1/attendance"));
  }
}

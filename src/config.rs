use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the remote API, e.g. "https://api.example.org"
  pub upstream: String,
  /// Loopback address the agent listens on
  #[serde(default = "default_listen")]
  pub listen: String,
  /// Build identifier reported to foreground instances
  #[serde(default = "default_version")]
  pub version: String,
  /// Directory for the store and log files (defaults to $XDG_DATA_HOME/outpost)
  pub data_dir: Option<PathBuf>,
  /// Prior-generation offline store (defaults to <data_dir>/legacy-offline.db)
  pub legacy_db: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Path prefixes that are never cached and never queued
  #[serde(default = "default_auth_paths")]
  pub auth_paths: Vec<String>,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub legacy: LegacyConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_standard_ttl_hours")]
  pub standard_ttl_hours: i64,
  #[serde(default = "default_camp_ttl_days")]
  pub camp_ttl_days: i64,
  /// Path keywords that get the extended TTL while camp mode is on
  #[serde(default = "default_camp_keywords", deserialize_with = "deserialize_lowercase_vec")]
  pub camp_keywords: Vec<String>,
  /// GET paths under these prefixes are cacheable
  #[serde(default = "default_cacheable_prefixes")]
  pub cacheable_prefixes: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      standard_ttl_hours: default_standard_ttl_hours(),
      camp_ttl_days: default_camp_ttl_days(),
      camp_keywords: default_camp_keywords(),
      cacheable_prefixes: default_cacheable_prefixes(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// How often connectivity is probed while sync tags are registered
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
  /// Replay on a fixed cadence as well, even without a registered tag
  pub periodic_interval_secs: Option<u64>,
  /// Drop a mutation after this many deferred attempts (unbounded if unset)
  pub max_attempts: Option<u32>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: default_probe_interval_secs(),
      periodic_interval_secs: None,
      max_attempts: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyConfig {
  /// Prefix joined with a legacy record's `action` to rebuild its URL path
  #[serde(default = "default_action_prefix")]
  pub action_prefix: String,
}

impl Default for LegacyConfig {
  fn default() -> Self {
    Self {
      action_prefix: default_action_prefix(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// tracing filter directive; RUST_LOG wins when set
  pub level: Option<String>,
  /// Log to stderr instead of the rolling file
  #[serde(default)]
  pub stderr: bool,
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

fn default_listen() -> String {
  "127.0.0.1:8787".to_string()
}

fn default_version() -> String {
  env!("CARGO_PKG_VERSION").to_string()
}

fn default_standard_ttl_hours() -> i64 {
  24
}

fn default_camp_ttl_days() -> i64 {
  7
}

fn default_camp_keywords() -> Vec<String> {
  [
    "participants",
    "groups",
    "attendance",
    "points",
    "honors",
    "badges",
    "activities",
    "calendar",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

fn default_cacheable_prefixes() -> Vec<String> {
  vec!["/api/".to_string()]
}

fn default_auth_paths() -> Vec<String> {
  [
    "/api/auth/",
    "/api/login",
    "/api/logout",
    "/api/register",
    "/api/refresh-token",
    "/api/verify-session",
    "/public/login",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

fn default_probe_interval_secs() -> u64 {
  15
}

fn default_action_prefix() -> String {
  "/api/".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./outpost.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/outpost/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/outpost/config.yaml\n\
                 or pass --upstream on the command line."
      )),
    }
  }

  /// Configuration with every default and the given upstream.
  pub fn with_upstream(upstream: &str) -> Result<Self> {
    Self::from_yaml(&format!("upstream: {:?}", upstream))
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("outpost.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("outpost").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Directory holding the store and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("outpost"))
  }

  pub fn store_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("outpost.db"))
  }

  pub fn legacy_path(&self) -> Result<PathBuf> {
    match &self.legacy_db {
      Some(path) => Ok(path.clone()),
      None => Ok(self.data_dir()?.join("legacy-offline.db")),
    }
  }

  /// Resolve a path (or already absolute URL) against the upstream base.
  pub fn upstream_url(&self, path_and_query: &str) -> String {
    if path_and_query.starts_with("http://") || path_and_query.starts_with("https://") {
      return path_and_query.to_string();
    }
    format!(
      "{}/{}",
      self.upstream.trim_end_matches('/'),
      path_and_query.trim_start_matches('/')
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_fill_in() {
    let config = Config::with_upstream("https://api.example.org/").unwrap();
    assert_eq!(config.listen, "127.0.0.1:8787");
    assert_eq!(config.cache.standard_ttl_hours, 24);
    assert_eq!(config.cache.camp_ttl_days, 7);
    assert!(config.auth_paths.iter().any(|p| p == "/api/auth/"));
    assert!(config.sync.max_attempts.is_none());
  }

  #[test]
  fn test_camp_keywords_are_lowercased() {
    let config = Config::from_yaml(
      "upstream: https://api.example.org\ncache:\n  camp_keywords: [Groups, POINTS]\n",
    )
    .unwrap();
    assert_eq!(config.cache.camp_keywords, vec!["groups", "points"]);
    assert_eq!(config.cache.standard_ttl_hours, 24);
  }

  #[test]
  fn test_upstream_url() {
    let config = Config::with_upstream("https://api.example.org/").unwrap();
    assert_eq!(
      config.upstream_url("/api/v1/groups?x=1"),
      "https://api.example.org/api/v1/groups?x=1"
    );
    assert_eq!(
      config.upstream_url("https://other.example.org/a"),
      "https://other.example.org/a"
    );
  }

  #[test]
  fn test_missing_upstream_is_an_error() {
    assert!(Config::from_yaml("listen: 127.0.0.1:9000\n").is_err());
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CachePolicy;

/// Environment variable that overrides `backend.url`.
pub const BACKEND_URL_ENV: &str = "AIRQ_BACKEND_URL";

/// Port the backend listens on when only an origin is known.
const DEFAULT_BACKEND_PORT: u16 = 5000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub query: QueryConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
  /// Explicit backend base URL
  pub url: Option<String>,
  /// Per-request timeout; unset means no timeout
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub freshness_secs: u64,
  /// Stale entries older than this are dropped
  pub retention_secs: u64,
  pub max_entries: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let policy = CachePolicy::default();
    Self {
      freshness_secs: policy.freshness.as_secs(),
      retention_secs: policy.retention.as_secs(),
      max_entries: policy.max_entries,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryConfig {
  /// Defaults to the cache freshness window
  pub refresh_secs: Option<u64>,
  pub debounce_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Write a daily rolling log file here in addition to stderr
  pub dir: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./airq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/airq/config.yaml
  ///
  /// No file at all means defaults.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("airq.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("airq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is valid and means defaults.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  pub fn cache_policy(&self) -> CachePolicy {
    CachePolicy {
      freshness: Duration::from_secs(self.cache.freshness_secs),
      retention: Duration::from_secs(self.cache.retention_secs),
      max_entries: self.cache.max_entries,
    }
  }

  pub fn request_timeout(&self) -> Option<Duration> {
    self.backend.timeout_secs.map(Duration::from_secs)
  }

  pub fn refresh_interval(&self) -> Duration {
    Duration::from_secs(
      self
        .query
        .refresh_secs
        .unwrap_or(self.cache.freshness_secs),
    )
  }

  pub fn debounce(&self) -> Option<Duration> {
    self.query.debounce_ms.map(Duration::from_millis)
  }

  /// Resolve the backend base URL.
  ///
  /// Precedence: `explicit` (command line), then `AIRQ_BACKEND_URL`, then
  /// `backend.url` from the file, then `origin` with its port swapped for
  /// the backend's.
  pub fn backend_url(&self, explicit: Option<&str>, origin: &Url) -> Result<Url> {
    let env = std::env::var(BACKEND_URL_ENV).ok();
    resolve_backend_url(explicit, env.as_deref(), self.backend.url.as_deref(), origin)
  }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
  s.map(str::trim).filter(|s| !s.is_empty())
}

fn resolve_backend_url(
  explicit: Option<&str>,
  env: Option<&str>,
  file: Option<&str>,
  origin: &Url,
) -> Result<Url> {
  let configured = non_blank(explicit)
    .or_else(|| non_blank(env))
    .or_else(|| non_blank(file));

  if let Some(raw) = configured {
    let url = Url::parse(raw).map_err(|e| eyre!("Invalid backend URL '{}': {}", raw, e))?;
    if url.cannot_be_a_base() {
      return Err(eyre!("Backend URL '{}' cannot be used as a base", raw));
    }
    return Ok(url);
  }

  let host = origin
    .host_str()
    .ok_or_else(|| eyre!("Origin '{}' has no host", origin))?;
  let mut url = Url::parse(&format!("{}://{}/", origin.scheme(), host))
    .map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
  url
    .set_port(Some(DEFAULT_BACKEND_PORT))
    .map_err(|_| eyre!("Origin '{}' cannot carry a port", origin))?;
  Ok(url)
}

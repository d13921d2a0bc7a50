use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub base_url: String,
  /// Collection name to API path, e.g. `coins: /api/coins`.
  /// Collections not listed map to `/api/<collection>`.
  #[serde(default)]
  pub collections: BTreeMap<String, String>,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:5000".to_string(),
      collections: BTreeMap::new(),
    }
  }
}

impl RemoteConfig {
  pub fn collection_path(&self, collection: &str) -> String {
    self
      .collections
      .get(collection)
      .cloned()
      .unwrap_or_else(|| format!("/api/{}", collection))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
  /// Database file (default: $XDG_DATA_HOME/hoard/hoard.db)
  pub path: Option<PathBuf>,
  /// How long an open waits on another session's schema upgrade
  #[serde(default = "default_busy_timeout_ms")]
  pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      busy_timeout_ms: default_busy_timeout_ms(),
    }
  }
}

impl StoreConfig {
  pub fn busy_timeout(&self) -> Duration {
    Duration::from_millis(self.busy_timeout_ms)
  }
}

fn default_busy_timeout_ms() -> u64 {
  5_000
}

/// Reconciler tuning. None of these are protocol contracts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_attempts: u32,
  pub backoff_base_ms: u64,
  pub backoff_cap_ms: u64,
  pub worker_limit: usize,
  pub request_timeout_secs: u64,
  /// Background reconnection tick
  pub tick_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 6,
      backoff_base_ms: 1_000,
      backoff_cap_ms: 60_000,
      worker_limit: 4,
      request_timeout_secs: 15,
      tick_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Cache generation identifier. Bump it to invalidate every cached response.
  pub generation: String,
  /// Activate a new generation without waiting for SKIP_ACTIVATION
  pub skip_waiting: bool,
  /// Origin whose requests are intercepted (default: the remote base URL).
  /// Requests to any other origin pass straight through.
  pub origin: Option<String>,
  pub cache_first_prefixes: Vec<String>,
  pub network_first_prefixes: Vec<String>,
  /// Age after which cached responses are evicted. 0 disables age eviction.
  pub max_age_secs: u64,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      generation: "v1".to_string(),
      skip_waiting: true,
      origin: None,
      cache_first_prefixes: vec!["/static/".to_string(), "/assets/".to_string()],
      network_first_prefixes: vec!["/api/".to_string()],
      max_age_secs: 7 * 24 * 60 * 60,
    }
  }
}

impl ProxyConfig {
  pub fn max_age(&self) -> Option<chrono::Duration> {
    if self.max_age_secs == 0 {
      None
    } else {
      Some(chrono::Duration::seconds(self.max_age_secs as i64))
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hoard.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hoard/config.yaml
  ///
  /// With no file found every section falls back to its defaults.
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
    let local = PathBuf::from("hoard.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hoard").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.sync.worker_limit == 0 {
      return Err(eyre!("sync.worker_limit must be at least 1"));
    }
    if config.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    Ok(config)
  }

  /// Origin the proxy intercepts.
  pub fn proxy_origin(&self) -> &str {
    self.proxy.origin.as_deref().unwrap_or(&self.remote.base_url)
  }

  /// Get the API token from the environment.
  ///
  /// Checks HOARD_API_TOKEN. Requests go out unauthenticated without it.
  pub fn get_api_token() -> Option<String> {
    std::env::var("HOARD_API_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

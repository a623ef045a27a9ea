use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::FreshnessPolicy;
use crate::health::MetricType;

/// Largest TTL chrono can represent, in seconds
const MAX_TTL_SECS: u64 = i64::MAX as u64 / 1000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub health: HealthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend root, e.g. "https://api.example.com"
  pub base_url: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Served without a refresh while younger than this
  #[serde(default = "default_fresh_ttl_secs")]
  pub fresh_ttl_secs: u64,
  /// Served with a background refresh while younger than this
  #[serde(default = "default_stale_ttl_secs")]
  pub stale_ttl_secs: u64,
  /// Hard eviction ceiling; defaults to the stale TTL
  pub max_age_secs: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      fresh_ttl_secs: default_fresh_ttl_secs(),
      stale_ttl_secs: default_stale_ttl_secs(),
      max_age_secs: None,
    }
  }
}

impl CacheConfig {
  pub fn policy(&self) -> FreshnessPolicy {
    let policy = FreshnessPolicy::new(ttl(self.fresh_ttl_secs), ttl(self.stale_ttl_secs));
    match self.max_age_secs {
      Some(max_age) => policy.with_max_age(ttl(max_age)),
      None => policy,
    }
  }
}

fn ttl(secs: u64) -> chrono::Duration {
  chrono::Duration::seconds(secs.min(MAX_TTL_SECS) as i64)
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Periodic tick while foregrounded
  #[serde(default = "default_interval_secs")]
  pub interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_interval_secs(),
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
  /// Days covered by the very first sync
  #[serde(default = "default_initial_sync_days")]
  pub initial_sync_days: u32,
  /// Metric types requested from the device
  #[serde(default = "MetricType::all")]
  pub metrics: Vec<MetricType>,
}

impl Default for HealthConfig {
  fn default() -> Self {
    Self {
      initial_sync_days: default_initial_sync_days(),
      metrics: MetricType::all(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_fresh_ttl_secs() -> u64 {
  60
}

fn default_stale_ttl_secs() -> u64 {
  300
}

fn default_interval_secs() -> u64 {
  15 * 60
}

fn default_initial_sync_days() -> u32 {
  14
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./insight-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/insight-sync/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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
    let local = PathBuf::from("insight-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("insight-sync").join("config.yaml");
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
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document deserializes to null
    let config: Config = if contents.trim().is_empty() {
      Config::default()
    } else {
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?
    };

    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.cache.fresh_ttl_secs > self.cache.stale_ttl_secs {
      return Err(eyre!(
        "cache.fresh_ttl_secs ({}) must not exceed cache.stale_ttl_secs ({})",
        self.cache.fresh_ttl_secs,
        self.cache.stale_ttl_secs
      ));
    }
    if let Some(max_age) = self.cache.max_age_secs {
      if max_age < self.cache.stale_ttl_secs {
        return Err(eyre!(
          "cache.max_age_secs ({}) must be at least cache.stale_ttl_secs ({})",
          max_age,
          self.cache.stale_ttl_secs
        ));
      }
    }
    if self.sync.interval_secs == 0 {
      return Err(eyre!("sync.interval_secs must be greater than zero"));
    }
    if self.health.initial_sync_days == 0 {
      return Err(eyre!("health.initial_sync_days must be greater than zero"));
    }
    Ok(())
  }

  /// Get the backend bearer token from environment variables.
  ///
  /// Checks INSIGHT_SYNC_API_TOKEN first, then INSIGHT_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("INSIGHT_SYNC_API_TOKEN")
      .or_else(|_| std::env::var("INSIGHT_API_TOKEN"))
      .map_err(|_| {
        eyre!(
          "API token not found. Set INSIGHT_SYNC_API_TOKEN or INSIGHT_API_TOKEN environment variable."
        )
      })
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub storage: StorageConfig,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL of the bookkeeping API (paths are appended as `/api/...`)
  pub base_url: String,
  /// Per-request timeout
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000".to_string(),
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Whether to keep offline data at all
  pub enabled: bool,
  /// Database file (default: $XDG_DATA_HOME/rentsync/offline.db)
  pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Local cache TTL
  pub ttl_ms: i64,
  pub max_entries: usize,
  pub max_size_bytes: u64,
  /// Minimum gap between opportunistic expired-entry sweeps
  pub cleanup_interval_ms: i64,
  /// Shared cache TTL
  pub shared_ttl_secs: u64,
  /// Entry schema tag; bump to discard every persisted entry
  pub version: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_ms: 5 * 60 * 1000,
      max_entries: 50,
      max_size_bytes: 5 * 1024 * 1024,
      cleanup_interval_ms: 60 * 1000,
      shared_ttl_secs: 300,
      version: "1".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Attempts after which an entry needs manual resolution
  pub max_attempts: u32,
  /// Periodic background drain; 0 disables it
  pub interval_secs: u64,
  /// How long a drain holds the cross-process sync lease
  pub lease_ttl_ms: i64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 10,
      interval_secs: 30,
      lease_ttl_ms: 60 * 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Also write logs to this file
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rentsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rentsync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
    let local = PathBuf::from("rentsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rentsync").join("config.yaml");
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
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Database location, honoring the configured override.
  pub fn database_path(&self) -> Option<PathBuf> {
    self
      .storage
      .path
      .clone()
      .or_else(crate::db::SqliteStore::default_path)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks RENTSYNC_API_TOKEN. The token is optional.
  pub fn get_api_token() -> Option<String> {
    std::env::var("RENTSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::HashAlgorithm;
use crate::client::CacheTtls;
use crate::gateway::{GatewayConfig, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT};
use crate::queue::DEFAULT_MAX_RETRIES;
use crate::sync::DEFAULT_SYNC_TAG;

const SESSION_TOKEN_VAR: &str = "EPICARE_SESSION_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub service: ServiceConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub worker: WorkerConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Base URL every action is posted to
  pub url: String,
  /// Per-attempt timeout
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_attempts")]
  pub attempts: u32,
  /// Base delay; attempt n waits n times this long
  #[serde(default = "default_delay_ms")]
  pub delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      attempts: default_attempts(),
      delay_ms: default_delay_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// SQLite file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      path: None,
      max_retries: default_max_retries(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_evaluate_ttl")]
  pub evaluate_ttl_secs: u64,
  #[serde(default = "default_config_ttl")]
  pub config_ttl_secs: u64,
  #[serde(default = "default_metadata_ttl")]
  pub metadata_ttl_secs: u64,
  /// sha256 or rolling
  #[serde(default)]
  pub fingerprint: HashAlgorithm,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      evaluate_ttl_secs: default_evaluate_ttl(),
      config_ttl_secs: default_config_ttl(),
      metadata_ttl_secs: default_metadata_ttl(),
      fingerprint: HashAlgorithm::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
  #[serde(default = "default_sync_tag")]
  pub sync_tag: String,
  /// Periodic drain while online; 0 disables
  #[serde(default)]
  pub poll_interval_secs: u64,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      sync_tag: default_sync_tag(),
      poll_interval_secs: 0,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Filter directive, overridden by RUST_LOG
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Also write logs to this file
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: None,
    }
  }
}

fn default_timeout_ms() -> u64 {
  DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_attempts() -> u32 {
  DEFAULT_RETRY_ATTEMPTS
}

fn default_delay_ms() -> u64 {
  DEFAULT_RETRY_DELAY.as_millis() as u64
}

fn default_max_retries() -> u32 {
  DEFAULT_MAX_RETRIES
}

fn default_evaluate_ttl() -> u64 {
  5 * 60
}

fn default_config_ttl() -> u64 {
  15 * 60
}

fn default_metadata_ttl() -> u64 {
  60 * 60
}

fn default_sync_tag() -> String {
  DEFAULT_SYNC_TAG.to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./epicare-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/epicare-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/epicare-sync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("epicare-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("epicare-sync").join("config.yaml");
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
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.service.url)
      .map_err(|e| eyre!("Invalid service.url {}: {}", self.service.url, e))?;
    if self.retry.attempts == 0 {
      return Err(eyre!("retry.attempts must be at least 1"));
    }
    if self.service.timeout_ms == 0 {
      return Err(eyre!("service.timeout_ms must be greater than 0"));
    }
    Ok(())
  }

  pub fn gateway(&self) -> GatewayConfig {
    GatewayConfig {
      timeout: Duration::from_millis(self.service.timeout_ms),
      retry_attempts: self.retry.attempts,
      retry_delay: Duration::from_millis(self.retry.delay_ms),
    }
  }

  pub fn cache_ttls(&self) -> CacheTtls {
    CacheTtls {
      evaluate: Duration::from_secs(self.cache.evaluate_ttl_secs),
      config: Duration::from_secs(self.cache.config_ttl_secs),
      metadata: Duration::from_secs(self.cache.metadata_ttl_secs),
    }
  }

  pub fn poll_interval(&self) -> Option<Duration> {
    let secs = self.worker.poll_interval_secs;
    (secs > 0).then(|| Duration::from_secs(secs))
  }

  /// Get the session token from the environment, if one is set.
  ///
  /// Checks EPICARE_SESSION_TOKEN.
  pub fn get_session_token() -> Option<String> {
    std::env::var(SESSION_TOKEN_VAR)
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}

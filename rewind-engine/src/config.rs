//! Configuration management for the migration engine.
//!
//! Loads configuration from a TOML file. Every value has a default so a
//! partial file is valid; credentials are never part of the configuration.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: EnvironmentConfig,
    pub target: EnvironmentConfig,
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

/// Connection settings for one platform environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// OAuth login host, e.g. `https://test.salesforce.com`
    #[serde(default = "default_login_url")]
    pub login_url: String,

    /// Connected-app consumer key
    #[serde(default)]
    pub client_id: String,

    /// REST API version without the `v` prefix
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Records per export page and per import batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live of a cached describe, in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Refresh the session when it expires within this window
    #[serde(default = "default_lookahead_secs")]
    pub lookahead_secs: u64,

    /// Lifetime assumed for a freshly issued token
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Retry ceiling for invalid-session and transient failures
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Upper bound on a single remote call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// First backoff delay; doubles per attempt
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory that receives new backups
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Where restore checkpoints live (defaults to the backup directory)
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_login_url() -> String {
    "https://test.salesforce.com".to_string()
}

fn default_api_version() -> String {
    "59.0".to_string()
}

fn default_batch_size() -> usize {
    200
}

fn default_cache_ttl_secs() -> u64 {
    15 * 60
}

fn default_lookahead_secs() -> u64 {
    5 * 60
}

fn default_session_ttl_secs() -> u64 {
    2 * 60 * 60
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            client_id: String::new(),
            api_version: default_api_version(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lookahead_secs: default_lookahead_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            call_timeout_secs: default_call_timeout_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            checkpoint_dir: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl SessionConfig {
    pub fn lookahead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lookahead_secs as i64)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

impl StorageConfig {
    pub fn checkpoint_dir(&self) -> &Path {
        self.checkpoint_dir.as_deref().unwrap_or(&self.backup_dir)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.batch_size == 0 {
            return Err(EngineError::Config("engine.batch_size must be at least 1".into()));
        }
        if self.session.call_timeout_secs == 0 {
            return Err(EngineError::Config(
                "session.call_timeout_secs must be at least 1".into(),
            ));
        }
        if self.session.lookahead_secs >= self.session.session_ttl_secs {
            return Err(EngineError::Config(format!(
                "session.lookahead_secs ({}) must be shorter than session.session_ttl_secs ({})",
                self.session.lookahead_secs, self.session.session_ttl_secs
            )));
        }
        for (label, env) in [("source", &self.source), ("target", &self.target)] {
            if !env.login_url.starts_with("http://") && !env.login_url.starts_with("https://") {
                return Err(EngineError::Config(format!(
                    "{}.login_url must be an http(s) URL, got {:?}",
                    label, env.login_url
                )));
            }
        }
        Ok(())
    }
}

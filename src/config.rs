//! Configuration loader and validator for the field agent and sync server.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub sync: SyncSettings,
    pub server: Server,
    pub tracking: Tracking,
    pub assignment: Assignment,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Identifies this handset in batch requests and server logs.
    pub device_id: String,
}

/// Outbox drain and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    pub poll_interval_ms: u64,
    pub batch_timeout_ms: u64,
    pub max_batch_size: usize,
    pub max_attempts: u32,
    pub base_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
}

/// Remote API settings (client side) and listener settings (server side).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    pub bind: String,
    pub database_url: String,
}

/// Location sampling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tracking {
    pub practitioner_id: String,
    /// 0 disables periodic tracking; fixes are then taken on demand only.
    pub update_interval_ms: u64,
    pub fix_path: String,
}

/// Assignment resolver tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub tie_epsilon_km: f64,
    pub default_duration_minutes: u32,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Location of the local outbox database, honouring `DATABASE_URL`.
    pub fn outbox_database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/outbox.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync.max_attempts,
            base_backoff: Duration::from_secs(self.sync.base_backoff_seconds),
            max_backoff: Duration::from_secs(self.sync.max_backoff_seconds),
        }
    }
}

/// Backoff schedule for transient sync failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Exponential backoff: `base * 2^attempt`, capped at `max_backoff`.
    /// A zero cap disables capping.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.min(16);
        let delay = self.base_backoff.saturating_mul(factor);
        if self.max_backoff.is_zero() {
            delay
        } else {
            delay.min(self.max_backoff)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.device_id.trim().is_empty() {
        return Err(ConfigError::Invalid("app.device_id must be non-empty"));
    }

    if cfg.sync.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("sync.poll_interval_ms must be > 0"));
    }
    if cfg.sync.batch_timeout_ms == 0 {
        return Err(ConfigError::Invalid("sync.batch_timeout_ms must be > 0"));
    }
    if cfg.sync.max_batch_size == 0 {
        return Err(ConfigError::Invalid("sync.max_batch_size must be > 0"));
    }
    if cfg.sync.max_attempts == 0 {
        return Err(ConfigError::Invalid("sync.max_attempts must be > 0"));
    }
    // max_backoff_seconds == 0 means "uncapped"

    if cfg.server.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("server.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.server.base_url).is_err() {
        return Err(ConfigError::Invalid("server.base_url must be an absolute URL"));
    }
    if cfg.server.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("server.bind must be non-empty"));
    }
    if cfg.server.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("server.database_url must be non-empty"));
    }

    if cfg.tracking.practitioner_id.trim().is_empty() {
        return Err(ConfigError::Invalid("tracking.practitioner_id must be non-empty"));
    }
    if uuid::Uuid::parse_str(cfg.tracking.practitioner_id.trim()).is_err() {
        return Err(ConfigError::Invalid("tracking.practitioner_id must be a UUID"));
    }
    if cfg.tracking.fix_path.trim().is_empty() {
        return Err(ConfigError::Invalid("tracking.fix_path must be non-empty"));
    }

    if !cfg.assignment.tie_epsilon_km.is_finite() || cfg.assignment.tie_epsilon_km < 0.0 {
        return Err(ConfigError::Invalid("assignment.tie_epsilon_km must be >= 0"));
    }
    if cfg.assignment.default_duration_minutes == 0 {
        return Err(ConfigError::Invalid("assignment.default_duration_minutes must be > 0"));
    }

    Ok(())
}

/// Returns a complete sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  device_id: "handset-01"

sync:
  poll_interval_ms: 30000
  batch_timeout_ms: 15000
  max_batch_size: 100
  max_attempts: 5
  base_backoff_seconds: 5
  max_backoff_seconds: 300

server:
  base_url: "http://127.0.0.1:8080/"
  api_token: "YOUR_API_TOKEN"
  bind: "0.0.0.0:8080"
  database_url: "sqlite://./data/server.db"

tracking:
  practitioner_id: "6f1c2a52-8d0e-4b1b-9a55-2f0e1f7c3d10"
  update_interval_ms: 60000
  fix_path: "./data/last_fix.json"

assignment:
  tie_epsilon_km: 0.05
  default_duration_minutes: 60
"#
}

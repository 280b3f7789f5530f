use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::cache::CacheLimits;

/// Main configuration structure for the agent cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Cache capacity and construction settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Agent cache configuration
///
/// Bounds are kept as raw numbers so that negative or non-finite values
/// coming from files or the environment normalize to "unbounded" instead of
/// failing to load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheConfig {
    /// Global cap across all users (omitted = unbounded)
    #[serde(default)]
    pub max_cached_agents: Option<f64>,

    /// Cap per user (omitted = unbounded)
    #[serde(default)]
    pub max_cached_agents_per_user: Option<f64>,

    /// Optional timeout applied to every agent construction, in milliseconds
    #[serde(default)]
    pub init_timeout_ms: Option<u64>,
}

impl CacheConfig {
    /// Normalized capacity bounds
    pub fn limits(&self) -> CacheLimits {
        CacheLimits::from_raw(self.max_cached_agents, self.max_cached_agents_per_user)
    }

    /// Construction timeout, if configured
    pub fn init_timeout(&self) -> Option<Duration> {
        self.init_timeout_ms.map(Duration::from_millis)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Directory for log files (if None logs only to stdout)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Enable stdout logging
    #[serde(default = "default_true")]
    pub enable_stdout: bool,

    /// Log file rotation policy
    #[serde(default)]
    pub rotation: RotationPolicy,
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    /// Human-readable multi-line output
    Pretty,
}

/// When the log file rolls over
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    /// New file every day
    #[default]
    Daily,
    /// New file every hour
    Hourly,
    /// Single file, never rotated
    Never,
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

const fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            enable_stdout: true,
            rotation: RotationPolicy::default(),
        }
    }
}

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
///
/// Cache bounds never fail validation: negative or non-finite values are
/// normalized to "unbounded" when the limits are built.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Level is not one of the tracing levels.
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// A zero timeout would fail every construction.
    #[error("Invalid init_timeout_ms: 0. Omit the setting to disable the timeout")]
    ZeroInitTimeout,

    /// `log_dir` was set to an empty path.
    #[error("Log directory cannot be empty when set")]
    EmptyLogDir,
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .agent-cache/config.yaml (project config)
    /// 3. .agent-cache/local.yaml (project local overrides, optional)
    /// 4. Environment variables (AGENT_CACHE_* prefix, `__` separates sections)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".agent-cache/config.yaml"))
            .merge(Yaml::file(".agent-cache/local.yaml"))
            .merge(Env::prefixed("AGENT_CACHE_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        if let Some(dir) = &config.logging.log_dir {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::EmptyLogDir);
            }
        }

        if config.cache.init_timeout_ms == Some(0) {
            return Err(ConfigError::ZeroInitTimeout);
        }

        Ok(())
    }
}

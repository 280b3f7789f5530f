//! Infrastructure layer module
//!
//! Adapters the cache is wired up with at the composition root:
//! - Configuration management (figment)
//! - Logging infrastructure (tracing)

pub mod config;
pub mod logging;

pub use config::{ConfigError, ConfigLoader};
pub use logging::LoggerImpl;

//! Value types shared across the crate.

pub mod cache;
pub mod config;

pub use cache::{CacheBound, CacheEntryInfo, CacheKey, CacheLimits, CacheStats, EntryState};
pub use config::{CacheConfig, Config, LogFormat, LoggingConfig, RotationPolicy};

//! Agent Cache - per-user agent instance cache for multi-agent orchestration
//!
//! Holds at most one live instance per `(user_id, agent_id)` pair, shares a
//! single in-flight construction between concurrent callers, and bounds memory
//! with LRU eviction both globally and per user. Agents leaving the cache are
//! disposed through the [`CachedAgent`] port.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): cache models, the agent port, errors
//! - **Service Layer** (`services`): the [`AgentCacheManager`]
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use agent_cache::{AgentCacheManager, ConfigLoader, LoggerImpl};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let _logger = LoggerImpl::init(&config.logging)?;
//!     let cache: AgentCacheManager<PlannerAgent> = AgentCacheManager::from_config(&config.cache);
//!
//!     let planner = cache
//!         .get_or_create("user-42", "planner", || async { Ok(Arc::new(PlannerAgent::connect().await?)) })
//!         .await?;
//!     planner.plan("...").await?;
//!
//!     cache.clear().await;
//!     Ok(())
//! }
//! ```

pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::models::{
    CacheBound, CacheConfig, CacheEntryInfo, CacheKey, CacheLimits, CacheStats, Config,
    EntryState, LoggingConfig,
};
pub use domain::ports::CachedAgent;
pub use domain::{CacheError, CacheResult};
pub use infrastructure::{ConfigError, ConfigLoader, LoggerImpl};
pub use services::{global_cache, AgentCacheManager};

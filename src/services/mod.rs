//! Service layer
//!
//! Business logic coordination. The agent cache is the only service: it owns
//! the lifecycle of constructed agents on behalf of the orchestration layer.

pub mod agent_cache;

pub use agent_cache::{global_cache, AgentCacheManager};

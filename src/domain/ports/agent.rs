//! Cached agent port - the only capability the cache needs from an agent.

use async_trait::async_trait;

/// An opaque, disposable agent instance managed by the cache.
///
/// The cache never looks inside an agent. It only hands shared references to
/// callers and tears the instance down once it leaves the cache (eviction,
/// invalidation, replacement or clear).
#[async_trait]
pub trait CachedAgent: Send + Sync + 'static {
    /// Release everything the agent holds (connections, subprocesses, buffers).
    ///
    /// Called at most once per cache exit. Errors are logged by the cache and
    /// never reach cache callers.
    async fn dispose(&self) -> anyhow::Result<()>;
}


//! Agent instance cache with bounded LRU eviction and single-flight construction.
//!
//! Holds at most one live agent per `(user_id, agent_id)` pair. Two indices are
//! kept in lockstep inside one critical section:
//!
//! - a global index (`IndexMap`, insertion/access order = LRU order) that backs
//!   the `max_cached_agents` bound;
//! - a per-user index (`user_id -> IndexSet<agent_id>`, same order discipline)
//!   that backs the `max_cached_agents_per_user` bound.
//!
//! Construction runs on a spawned tokio task and is shared between every caller
//! asking for the same key while it is in flight, so a factory runs at most once
//! per attempt. A failed attempt removes its entry; the next call starts fresh.
//!
//! Agents leaving the cache (eviction, invalidation, replacement, clear) are
//! disposed. Dispose failures are logged and counted, never returned.
//!
//! # Examples
//!
//! ```ignore
//! use std::sync::Arc;
//! use agent_cache::services::AgentCacheManager;
//! use agent_cache::domain::models::{CacheBound, CacheLimits};
//!
//! # async fn example(cache: AgentCacheManager<MyAgent>) -> anyhow::Result<()> {
//! cache.configure(CacheLimits::default().with_max_cached_agents_per_user(CacheBound::AtMost(4)));
//! let planner = cache
//!     .get_or_create("u1", "planner", || async { Ok(Arc::new(MyAgent::build().await?)) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use indexmap::{IndexMap, IndexSet};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::models::{
    CacheConfig, CacheEntryInfo, CacheKey, CacheLimits, CacheStats, EntryState,
};
use crate::domain::ports::CachedAgent;

type SharedConstruction<A> = Shared<BoxFuture<'static, CacheResult<Arc<A>>>>;

/// Why an agent is being disposed; attached to dispose logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisposeReason {
    Evicted,
    Invalidated,
    Replaced,
    Cleared,
}

impl DisposeReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Evicted => "evicted",
            Self::Invalidated => "invalidated",
            Self::Replaced => "replaced",
            Self::Cleared => "cleared",
        }
    }
}

enum Slot<A: ?Sized> {
    Pending(SharedConstruction<A>),
    Ready(Arc<A>),
}

impl<A: ?Sized> Clone for Slot<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending(construction) => Self::Pending(construction.clone()),
            Self::Ready(agent) => Self::Ready(Arc::clone(agent)),
        }
    }
}

impl<A: ?Sized> Slot<A> {
    const fn state(&self) -> EntryState {
        match self {
            Self::Pending(_) => EntryState::Pending,
            Self::Ready(_) => EntryState::Ready,
        }
    }
}

struct CacheEntry<A: ?Sized> {
    /// Attempt id; a construction only settles the entry it created.
    generation: u64,
    created_at: Instant,
    last_used: Instant,
    slot: Slot<A>,
}

impl<A: ?Sized> CacheEntry<A> {
    fn new(generation: u64, slot: Slot<A>) -> Self {
        let now = Instant::now();
        Self {
            generation,
            created_at: now,
            last_used: now,
            slot,
        }
    }
}

/// The two LRU indices. Every method mutates both or neither.
struct CacheIndex<A: ?Sized> {
    global: IndexMap<CacheKey, CacheEntry<A>>,
    per_user: HashMap<String, IndexSet<String>>,
}

impl<A: ?Sized> Default for CacheIndex<A> {
    fn default() -> Self {
        Self {
            global: IndexMap::new(),
            per_user: HashMap::new(),
        }
    }
}

impl<A: ?Sized> CacheIndex<A> {
    /// Move `key` to the MRU end of both indices.
    fn touch(&mut self, key: &CacheKey) -> Option<&mut CacheEntry<A>> {
        let idx = self.global.get_index_of(key)?;
        let last = self.global.len() - 1;
        self.global.move_index(idx, last);

        if let Some(agents) = self.per_user.get_mut(&key.user_id) {
            if let Some(pos) = agents.get_index_of(&key.agent_id) {
                let newest = agents.len() - 1;
                agents.move_index(pos, newest);
            }
        }

        let (_, entry) = self.global.get_index_mut(last)?;
        entry.last_used = Instant::now();
        Some(entry)
    }

    /// Insert at the MRU end, returning whatever previously occupied the key.
    fn insert(&mut self, key: CacheKey, entry: CacheEntry<A>) -> Option<CacheEntry<A>> {
        let displaced = self.remove(&key);
        self.per_user
            .entry(key.user_id.clone())
            .or_default()
            .insert(key.agent_id.clone());
        self.global.insert(key, entry);
        displaced
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<A>> {
        let entry = self.global.shift_remove(key)?;
        self.unlink_user(key);
        Some(entry)
    }

    /// Remove `key` only if it still holds the given construction attempt.
    fn remove_generation(&mut self, key: &CacheKey, generation: u64) -> Option<CacheEntry<A>> {
        if self.global.get(key)?.generation != generation {
            return None;
        }
        self.remove(key)
    }

    /// Pending -> Ready transition for one attempt. Returns false when the
    /// entry already left the cache or belongs to a newer attempt.
    fn resolve(&mut self, key: &CacheKey, generation: u64, agent: Arc<A>) -> bool {
        match self.global.get_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.slot = Slot::Ready(agent);
                entry.last_used = Instant::now();
                true
            }
            _ => false,
        }
    }

    fn unlink_user(&mut self, key: &CacheKey) {
        if let Some(agents) = self.per_user.get_mut(&key.user_id) {
            agents.shift_remove(&key.agent_id);
            if agents.is_empty() {
                self.per_user.remove(&key.user_id);
            }
        }
    }

    fn remove_user(&mut self, user_id: &str) -> Vec<(CacheKey, CacheEntry<A>)> {
        let Some(agents) = self.per_user.remove(user_id) else {
            return Vec::new();
        };
        agents
            .into_iter()
            .filter_map(|agent_id| {
                let key = CacheKey::new(user_id, agent_id);
                self.global.shift_remove(&key).map(|entry| (key, entry))
            })
            .collect()
    }

    fn drain(&mut self) -> Vec<(CacheKey, CacheEntry<A>)> {
        self.per_user.clear();
        std::mem::take(&mut self.global).into_iter().collect()
    }

    fn user_len(&self, user_id: &str) -> usize {
        self.per_user.get(user_id).map_or(0, IndexSet::len)
    }

    /// Pop LRU entries until both bounds hold, per-user pass first.
    ///
    /// Runs entirely under the state lock, so neither index can grow while
    /// the loops converge.
    fn collect_evictions(
        &mut self,
        user_id: &str,
        limits: CacheLimits,
    ) -> Vec<(CacheKey, CacheEntry<A>)> {
        let mut evicted = Vec::new();

        while limits
            .max_cached_agents_per_user
            .is_exceeded_by(self.user_len(user_id))
        {
            let Some(oldest) = self.per_user.get(user_id).and_then(|a| a.first().cloned()) else {
                break;
            };
            let key = CacheKey::new(user_id, oldest);
            match self.remove(&key) {
                Some(entry) => evicted.push((key, entry)),
                // Not in the global index; dropping it from the user set still makes progress.
                None => self.unlink_user(&key),
            }
        }

        while limits.max_cached_agents.is_exceeded_by(self.global.len()) {
            let Some((key, entry)) = self.global.shift_remove_index(0) else {
                break;
            };
            self.unlink_user(&key);
            evicted.push((key, entry));
        }

        evicted
    }
}

struct CacheState<A: ?Sized> {
    index: CacheIndex<A>,
    limits: CacheLimits,
    init_timeout: Option<Duration>,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    pending_joins: AtomicU64,
    init_failures: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    dispose_failures: AtomicU64,
}

impl CacheCounters {
    fn bump(counter: &AtomicU64, by: usize) {
        counter.fetch_add(by as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            pending_joins: self.pending_joins.load(Ordering::Relaxed),
            init_failures: self.init_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            dispose_failures: self.dispose_failures.load(Ordering::Relaxed),
        }
    }
}

struct CacheInner<A: ?Sized> {
    state: Mutex<CacheState<A>>,
    next_generation: AtomicU64,
    counters: CacheCounters,
}

impl<A: CachedAgent + ?Sized> CacheInner<A> {
    fn lock(&self) -> MutexGuard<'_, CacheState<A>> {
        // State is only mutated in non-panicking critical sections.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Body of the spawned construction task: build, settle the entry, enforce limits.
    async fn run_construction<F, Fut>(
        &self,
        key: CacheKey,
        generation: u64,
        timeout: Option<Duration>,
        init: F,
    ) -> CacheResult<Arc<A>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Arc<A>>> + Send + 'static,
    {
        let outcome = construct(&key, timeout, init).await;

        let settled = {
            let mut state = self.lock();
            match &outcome {
                Ok(agent) => state.index.resolve(&key, generation, Arc::clone(agent)),
                Err(_) => state.index.remove_generation(&key, generation).is_some(),
            }
        };

        match &outcome {
            Ok(_) if settled => debug!(
                user_id = %key.user_id,
                agent_id = %key.agent_id,
                "agent constructed"
            ),
            Ok(_) => debug!(
                user_id = %key.user_id,
                agent_id = %key.agent_id,
                "agent constructed after its entry left the cache"
            ),
            Err(err) => {
                CacheCounters::bump(&self.counters.init_failures, 1);
                warn!(
                    user_id = %key.user_id,
                    agent_id = %key.agent_id,
                    error = %err,
                    "agent construction failed"
                );
            }
        }

        self.enforce_limits(&key.user_id).await;
        outcome
    }

    async fn enforce_limits(&self, user_id: &str) {
        let evicted = {
            let mut state = self.lock();
            let limits = state.limits;
            state.index.collect_evictions(user_id, limits)
        };
        if evicted.is_empty() {
            return;
        }

        CacheCounters::bump(&self.counters.evictions, evicted.len());
        info!(
            user_id = %user_id,
            evicted = evicted.len(),
            keys = ?evicted.iter().map(|(key, _)| key.to_string()).collect::<Vec<_>>(),
            "evicting cached agents over capacity"
        );
        self.dispose_all(evicted, DisposeReason::Evicted).await;
    }

    async fn dispose_all(&self, entries: Vec<(CacheKey, CacheEntry<A>)>, reason: DisposeReason) {
        join_all(
            entries
                .into_iter()
                .map(|(key, entry)| self.dispose_slot(key, entry.slot, reason)),
        )
        .await;
    }

    /// Dispose whatever a slot holds, awaiting a pending construction first.
    ///
    /// A panicking `dispose` counts as a dispose failure; it must not unwind
    /// into the construction task that may be running this eviction.
    async fn dispose_slot(&self, key: CacheKey, slot: Slot<A>, reason: DisposeReason) {
        let agent = match slot {
            Slot::Ready(agent) => agent,
            Slot::Pending(construction) => match construction.await {
                Ok(agent) => agent,
                Err(err) => {
                    debug!(
                        user_id = %key.user_id,
                        agent_id = %key.agent_id,
                        reason = reason.as_str(),
                        error = %err,
                        "pending construction failed, nothing to dispose"
                    );
                    return;
                }
            },
        };

        let outcome = AssertUnwindSafe(agent.dispose())
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(anyhow::anyhow!(
                    "dispose panicked: {}",
                    panic_message(payload.as_ref())
                ))
            });

        match outcome {
            Ok(()) => debug!(
                user_id = %key.user_id,
                agent_id = %key.agent_id,
                reason = reason.as_str(),
                "agent disposed"
            ),
            Err(err) => {
                CacheCounters::bump(&self.counters.dispose_failures, 1);
                let error = format!("{err:#}");
                warn!(
                    user_id = %key.user_id,
                    agent_id = %key.agent_id,
                    reason = reason.as_str(),
                    error = %error,
                    "agent dispose failed"
                );
            }
        }
    }
}

/// Run the factory once, converting errors, panics and timeouts into [`CacheError`].
async fn construct<A, F, Fut>(
    key: &CacheKey,
    timeout: Option<Duration>,
    init: F,
) -> CacheResult<Arc<A>>
where
    A: ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<Arc<A>>>,
{
    let attempt = AssertUnwindSafe(async move { init().await }).catch_unwind();
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| CacheError::InitTimeout {
                key: key.clone(),
                timeout: limit,
            })?,
        None => attempt.await,
    };

    match result {
        Ok(Ok(agent)) => Ok(agent),
        Ok(Err(cause)) => Err(CacheError::init_failed(key.clone(), cause)),
        Err(payload) => Err(CacheError::InitPanicked {
            key: key.clone(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Process-local cache of agent instances keyed by `(user_id, agent_id)`.
///
/// Cheap to clone; clones share the same cache. Requires a tokio runtime,
/// constructions run on spawned tasks.
pub struct AgentCacheManager<A: CachedAgent + ?Sized> {
    inner: Arc<CacheInner<A>>,
}

impl<A: CachedAgent + ?Sized> Clone for AgentCacheManager<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: CachedAgent + ?Sized> Default for AgentCacheManager<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: CachedAgent + ?Sized> fmt::Debug for AgentCacheManager<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("AgentCacheManager")
            .field("entries", &state.index.global.len())
            .field("users", &state.index.per_user.len())
            .field("limits", &state.limits)
            .field("init_timeout", &state.init_timeout)
            .finish()
    }
}

impl<A: CachedAgent + ?Sized> AgentCacheManager<A> {
    /// Create an empty, unbounded cache.
    pub fn new() -> Self {
        Self::with_limits(CacheLimits::unbounded())
    }

    /// Create an empty cache enforcing `limits`.
    pub fn with_limits(limits: CacheLimits) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    index: CacheIndex::default(),
                    limits,
                    init_timeout: None,
                }),
                next_generation: AtomicU64::new(0),
                counters: CacheCounters::default(),
            }),
        }
    }

    /// Build a cache from loaded configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        let cache = Self::with_limits(config.limits());
        cache.set_init_timeout(config.init_timeout());
        cache
    }

    /// Replace both capacity bounds.
    ///
    /// Takes effect on the next mutating operation; nothing is evicted here.
    pub fn configure(&self, limits: CacheLimits) {
        self.inner.lock().limits = limits;
        info!(
            max_cached_agents = %limits.max_cached_agents,
            max_cached_agents_per_user = %limits.max_cached_agents_per_user,
            "agent cache limits configured"
        );
    }

    /// Currently configured bounds.
    pub fn limits(&self) -> CacheLimits {
        self.inner.lock().limits
    }

    /// Bound every future construction by `timeout` (`None` disables it).
    pub fn set_init_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock().init_timeout = timeout;
    }

    /// Return the cached agent for the key, joining or starting its construction.
    ///
    /// Concurrent calls for the same key share one `init` invocation and observe
    /// the same result. On failure the entry is removed so the next call retries.
    /// Capacity limits for `user_id` are enforced once construction settles; the
    /// freshly built agent is returned even if it was evicted right away.
    pub async fn get_or_create<F, Fut>(
        &self,
        user_id: &str,
        agent_id: &str,
        init: F,
    ) -> CacheResult<Arc<A>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Arc<A>>> + Send + 'static,
    {
        let key = CacheKey::new(user_id, agent_id);

        let construction = {
            let mut state = self.inner.lock();
            match state.index.touch(&key).map(|entry| entry.slot.clone()) {
                Some(Slot::Ready(agent)) => {
                    CacheCounters::bump(&self.inner.counters.hits, 1);
                    debug!(user_id = %user_id, agent_id = %agent_id, "agent cache hit");
                    return Ok(agent);
                }
                Some(Slot::Pending(construction)) => {
                    CacheCounters::bump(&self.inner.counters.pending_joins, 1);
                    debug!(user_id = %user_id, agent_id = %agent_id, "joining in-flight construction");
                    construction
                }
                None => {
                    CacheCounters::bump(&self.inner.counters.misses, 1);
                    let generation = self.inner.next_generation();
                    let construction =
                        self.spawn_construction(key.clone(), generation, state.init_timeout, init);
                    state.index.insert(
                        key,
                        CacheEntry::new(generation, Slot::Pending(construction.clone())),
                    );
                    debug!(user_id = %user_id, agent_id = %agent_id, generation, "agent construction started");
                    construction
                }
            }
        };

        construction.await
    }

    /// Spawn the construction task and wrap its handle so every waiter shares it.
    ///
    /// The task only takes the state lock after `init` has run, so the caller's
    /// insert always lands before the task settles the entry.
    fn spawn_construction<F, Fut>(
        &self,
        key: CacheKey,
        generation: u64,
        timeout: Option<Duration>,
        init: F,
    ) -> SharedConstruction<A>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Arc<A>>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            inner
                .run_construction(task_key, generation, timeout, init)
                .await
        });

        async move {
            handle.await.unwrap_or_else(|err| {
                Err(CacheError::InitAborted {
                    key,
                    reason: err.to_string(),
                })
            })
        }
        .boxed()
        .shared()
    }

    /// Return the agent only if it is cached and fully constructed.
    pub fn get(&self, user_id: &str, agent_id: &str) -> Option<Arc<A>> {
        let key = CacheKey::new(user_id, agent_id);
        let mut state = self.inner.lock();
        let ready = match state.index.global.get(&key).map(|entry| &entry.slot) {
            Some(Slot::Ready(agent)) => Arc::clone(agent),
            _ => return None,
        };
        state.index.touch(&key);
        CacheCounters::bump(&self.inner.counters.hits, 1);
        Some(ready)
    }

    /// Install an agent built outside the cache, then enforce limits.
    ///
    /// A different agent (or an in-flight construction) previously held under
    /// the key is disposed.
    pub async fn put(&self, user_id: &str, agent_id: &str, agent: Arc<A>) {
        let key = CacheKey::new(user_id, agent_id);
        let displaced = {
            let mut state = self.inner.lock();
            let generation = self.inner.next_generation();
            state.index.insert(
                key.clone(),
                CacheEntry::new(generation, Slot::Ready(Arc::clone(&agent))),
            )
        };

        if let Some(previous) = displaced {
            let same_agent =
                matches!(&previous.slot, Slot::Ready(existing) if Arc::ptr_eq(existing, &agent));
            if !same_agent {
                self.inner
                    .dispose_slot(key, previous.slot, DisposeReason::Replaced)
                    .await;
            }
        }

        self.inner.enforce_limits(user_id).await;
    }

    /// Remove one entry and dispose its agent. Absent keys are a no-op.
    pub async fn invalidate(&self, user_id: &str, agent_id: &str) {
        let key = CacheKey::new(user_id, agent_id);
        let Some(entry) = self.inner.lock().index.remove(&key) else {
            debug!(user_id = %user_id, agent_id = %agent_id, "invalidate: agent not cached");
            return;
        };

        CacheCounters::bump(&self.inner.counters.invalidations, 1);
        info!(
            user_id = %user_id,
            agent_id = %agent_id,
            state = entry.slot.state().as_str(),
            "invalidating cached agent"
        );
        self.inner
            .dispose_slot(key, entry.slot, DisposeReason::Invalidated)
            .await;
    }

    /// Invalidate every agent cached for one user.
    pub async fn invalidate_user(&self, user_id: &str) {
        let removed = self.inner.lock().index.remove_user(user_id);
        if removed.is_empty() {
            return;
        }

        CacheCounters::bump(&self.inner.counters.invalidations, removed.len());
        info!(user_id = %user_id, count = removed.len(), "invalidating all agents for user");
        self.inner
            .dispose_all(removed, DisposeReason::Invalidated)
            .await;
    }

    /// Empty the cache and dispose every agent concurrently.
    ///
    /// Entries inserted while the disposals run are left alone.
    pub async fn clear(&self) {
        let drained = self.inner.lock().index.drain();
        info!(count = drained.len(), "clearing agent cache");
        self.inner.dispose_all(drained, DisposeReason::Cleared).await;
    }

    /// Number of entries, pending constructions included.
    pub fn size(&self) -> usize {
        self.inner.lock().index.global.len()
    }

    /// Number of entries held for one user.
    pub fn user_size(&self, user_id: &str) -> usize {
        self.inner.lock().index.user_len(user_id)
    }

    /// Whether the key is cached, ready or pending. Does not affect LRU order.
    pub fn contains(&self, user_id: &str, agent_id: &str) -> bool {
        self.inner
            .lock()
            .index
            .global
            .contains_key(&CacheKey::new(user_id, agent_id))
    }

    /// Snapshot of all entries in LRU order, oldest first.
    pub fn entries(&self) -> Vec<CacheEntryInfo> {
        let now = Instant::now();
        self.inner
            .lock()
            .index
            .global
            .iter()
            .map(|(key, entry)| CacheEntryInfo {
                key: key.clone(),
                state: entry.slot.state(),
                age_ms: millis(now.saturating_duration_since(entry.created_at)),
                idle_ms: millis(now.saturating_duration_since(entry.last_used)),
            })
            .collect()
    }

    /// Lifetime counters since the cache was created.
    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot()
    }
}

static GLOBAL_CACHE: OnceLock<AgentCacheManager<dyn CachedAgent>> = OnceLock::new();

/// Process-wide default cache for call sites without an injected instance.
///
/// Prefer owning an [`AgentCacheManager`] at the application's composition
/// root and passing it down.
pub fn global_cache() -> &'static AgentCacheManager<dyn CachedAgent> {
    GLOBAL_CACHE.get_or_init(AgentCacheManager::new)
}

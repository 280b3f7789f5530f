//! Cache identity, capacity bounds and diagnostic snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite identity of one cached agent: the owning user plus the agent id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Owning user.
    pub user_id: String,
    /// Agent identifier, unique within one user.
    pub agent_id: String,
}

impl CacheKey {
    /// Build a key from its two parts.
    pub fn new(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: agent_id.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.agent_id)
    }
}

/// Capacity bound for one dimension of the cache.
///
/// A bound of `AtMost(0)` is legal and means "retain nothing": entries are
/// inserted and immediately evicted once their construction settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBound {
    /// No limit.
    #[default]
    Unbounded,
    /// Keep at most this many entries.
    AtMost(usize),
}

impl CacheBound {
    /// Normalize a raw numeric bound.
    ///
    /// Positive finite values are floored to a count, zero stays zero, and
    /// anything negative, NaN or infinite becomes [`CacheBound::Unbounded`].
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() || value < 0.0 {
            return Self::Unbounded;
        }
        // Saturating float->int cast; values beyond usize::MAX clamp.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let count = value.floor() as usize;
        Self::AtMost(count)
    }

    /// Normalize an optional raw bound; `None` means unbounded.
    pub fn from_option(value: Option<f64>) -> Self {
        value.map_or(Self::Unbounded, Self::from_f64)
    }

    /// Whether `len` entries violate this bound.
    pub const fn is_exceeded_by(self, len: usize) -> bool {
        match self {
            Self::Unbounded => false,
            Self::AtMost(max) => len > max,
        }
    }

    /// Whether no limit applies.
    pub const fn is_unbounded(self) -> bool {
        matches!(self, Self::Unbounded)
    }
}

impl From<i64> for CacheBound {
    fn from(value: i64) -> Self {
        usize::try_from(value).map_or(Self::Unbounded, Self::AtMost)
    }
}

impl From<usize> for CacheBound {
    fn from(value: usize) -> Self {
        Self::AtMost(value)
    }
}

impl fmt::Display for CacheBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::AtMost(max) => write!(f, "{max}"),
        }
    }
}

/// Both capacity bounds enforced by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheLimits {
    /// Cap across all users.
    #[serde(default)]
    pub max_cached_agents: CacheBound,

    /// Cap on the entries belonging to a single user.
    #[serde(default)]
    pub max_cached_agents_per_user: CacheBound,
}

impl CacheLimits {
    /// No limit in either dimension.
    pub const fn unbounded() -> Self {
        Self {
            max_cached_agents: CacheBound::Unbounded,
            max_cached_agents_per_user: CacheBound::Unbounded,
        }
    }

    /// Build limits from raw numeric options, normalizing each one.
    pub fn from_raw(max_cached_agents: Option<f64>, max_cached_agents_per_user: Option<f64>) -> Self {
        Self {
            max_cached_agents: CacheBound::from_option(max_cached_agents),
            max_cached_agents_per_user: CacheBound::from_option(max_cached_agents_per_user),
        }
    }

    /// Replace the global bound.
    #[must_use]
    pub const fn with_max_cached_agents(mut self, bound: CacheBound) -> Self {
        self.max_cached_agents = bound;
        self
    }

    /// Replace the per-user bound.
    #[must_use]
    pub const fn with_max_cached_agents_per_user(mut self, bound: CacheBound) -> Self {
        self.max_cached_agents_per_user = bound;
        self
    }
}

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Construction is in flight.
    Pending,
    /// The agent is constructed and can be handed out.
    Ready,
}

impl EntryState {
    /// Lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
        }
    }
}

/// Point-in-time view of one cache entry, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryInfo {
    /// Entry identity.
    pub key: CacheKey,
    /// Whether the agent is built yet.
    pub state: EntryState,
    /// Milliseconds since the entry was created.
    pub age_ms: u64,
    /// Milliseconds since the entry was last touched.
    pub idle_ms: u64,
}

/// Snapshot of the cache's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered by a ready entry.
    pub hits: u64,
    /// Lookups that started a new construction.
    pub misses: u64,
    /// Lookups that joined a construction already in flight.
    pub pending_joins: u64,
    /// Constructions that failed, panicked or timed out.
    pub init_failures: u64,
    /// Entries removed to satisfy a capacity bound.
    pub evictions: u64,
    /// Entries removed by explicit invalidation.
    pub invalidations: u64,
    /// Dispose calls that returned an error.
    pub dispose_failures: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache, in `[0.0, 1.0]`.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.pending_joins;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.pending_joins) as f64 / total as f64
        }
    }
}

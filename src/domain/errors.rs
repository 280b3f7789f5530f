//! Domain errors for the agent cache.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::domain::models::CacheKey;

/// Errors surfaced to callers of the agent cache.
///
/// Only construction failures are caller-visible. The error is clonable so a
/// single failed construction can be handed to every caller awaiting it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The factory returned an error.
    #[error("Agent initialization failed for {key}: {cause:#}")]
    InitFailed {
        /// Key being constructed.
        key: CacheKey,
        /// Error returned by the factory.
        cause: Arc<anyhow::Error>,
    },

    /// The factory panicked.
    #[error("Agent initialization panicked for {key}: {message}")]
    InitPanicked {
        /// Key being constructed.
        key: CacheKey,
        /// Panic payload rendered as text.
        message: String,
    },

    /// The configured init timeout expired.
    #[error("Agent initialization for {key} timed out after {}ms", .timeout.as_millis())]
    InitTimeout {
        /// Key being constructed.
        key: CacheKey,
        /// Timeout that expired.
        timeout: Duration,
    },

    /// The construction task was cancelled or died.
    #[error("Agent initialization for {key} was aborted: {reason}")]
    InitAborted {
        /// Key being constructed.
        key: CacheKey,
        /// Join error reported by the runtime.
        reason: String,
    },
}

impl CacheError {
    /// Wrap a factory error.
    pub fn init_failed(key: CacheKey, cause: anyhow::Error) -> Self {
        Self::InitFailed {
            key,
            cause: Arc::new(cause),
        }
    }

    /// The (user, agent) pair whose construction failed.
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::InitFailed { key, .. }
            | Self::InitPanicked { key, .. }
            | Self::InitTimeout { key, .. }
            | Self::InitAborted { key, .. } => key,
        }
    }

    /// The factory's own error, when the factory returned one.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::InitFailed { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }

    /// Whether the init timeout expired.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::InitTimeout { .. })
    }
}

/// Result of a cache construction.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_failed_display_includes_cause() {
        let err = CacheError::init_failed(
            CacheKey::new("u1", "planner"),
            anyhow::anyhow!("prompt template missing"),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("u1:planner"));
        assert!(rendered.contains("prompt template missing"));
        assert_eq!(err.key(), &CacheKey::new("u1", "planner"));
        assert!(err.cause().is_some());
    }

    #[test]
    fn test_clone_shares_cause() {
        let err = CacheError::init_failed(CacheKey::new("u", "a"), anyhow::anyhow!("boom"));
        let cloned = err.clone();
        match (&err, &cloned) {
            (
                CacheError::InitFailed { cause: a, .. },
                CacheError::InitFailed { cause: b, .. },
            ) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected InitFailed"),
        }
    }

    #[test]
    fn test_timeout_display() {
        let err = CacheError::InitTimeout {
            key: CacheKey::new("u", "a"),
            timeout: Duration::from_millis(250),
        };
        assert!(err.is_timeout());
        assert!(err.cause().is_none());
        assert_eq!(err.to_string(), "Agent initialization for u:a timed out after 250ms");
    }
}

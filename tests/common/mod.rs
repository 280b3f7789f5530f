//! Common test utilities for integration tests
//!
//! Provides test agents that record dispose calls and factories that count
//! their invocations.

use agent_cache::CachedAgent;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Boxed future returned by the test factories.
pub type AgentFuture = BoxFuture<'static, anyhow::Result<Arc<TestAgent>>>;

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
#[allow(dead_code)]
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// How a [`TestAgent`] behaves when disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisposeMode {
    Succeed,
    Fail,
    Panic,
}

/// Agent that counts dispose calls and can be told to fail them.
#[derive(Debug)]
pub struct TestAgent {
    pub name: String,
    disposed: AtomicUsize,
    mode: DisposeMode,
}

#[allow(dead_code)]
impl TestAgent {
    fn with_mode(name: impl Into<String>, mode: DisposeMode) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            disposed: AtomicUsize::new(0),
            mode,
        })
    }

    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_mode(name, DisposeMode::Succeed)
    }

    /// An agent whose dispose always returns an error.
    pub fn failing_dispose(name: impl Into<String>) -> Arc<Self> {
        Self::with_mode(name, DisposeMode::Fail)
    }

    /// An agent whose dispose panics after recording the call.
    pub fn panicking_dispose(name: impl Into<String>) -> Arc<Self> {
        Self::with_mode(name, DisposeMode::Panic)
    }

    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CachedAgent for TestAgent {
    async fn dispose(&self) -> anyhow::Result<()> {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            DisposeMode::Succeed => Ok(()),
            DisposeMode::Fail => anyhow::bail!("dispose failed for {}", self.name),
            DisposeMode::Panic => panic!("teardown blew up for {}", self.name),
        }
    }
}

/// Counts factory invocations across clones.
#[derive(Debug, Clone, Default)]
pub struct FactoryCounter(Arc<AtomicUsize>);

#[allow(dead_code)]
impl FactoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Factory producing a fresh agent after an optional delay.
    pub fn factory(
        &self,
        name: impl Into<String>,
        delay: Duration,
    ) -> impl FnOnce() -> AgentFuture + Send + 'static {
        let counter = Arc::clone(&self.0);
        let name = name.into();
        move || -> AgentFuture {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(TestAgent::new(name))
            }
            .boxed()
        }
    }

    /// Factory that fails after an optional delay.
    pub fn failing(
        &self,
        message: &'static str,
        delay: Duration,
    ) -> impl FnOnce() -> AgentFuture + Send + 'static {
        let counter = Arc::clone(&self.0);
        move || -> AgentFuture {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Err(anyhow::anyhow!(message))
            }
            .boxed()
        }
    }
}

/// Factory returning a pre-built agent, for tests that need to inspect it later.
#[allow(dead_code)]
pub fn returning(agent: Arc<TestAgent>) -> impl FnOnce() -> AgentFuture + Send + 'static {
    move || -> AgentFuture { async move { Ok(agent) }.boxed() }
}

//! Concurrency tests for AgentCacheManager
//!
//! Exercises single-flight construction and index consistency on the
//! multi-threaded tokio runtime.

mod common;

use agent_cache::{AgentCacheManager, CacheBound, CacheLimits};
use common::{AgentFuture, FactoryCounter, TestAgent};
use futures::future::{join_all, FutureExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Barrier;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_key_constructs_once() {
    common::setup_test_logging();
    let cache: AgentCacheManager<TestAgent> = AgentCacheManager::new();
    let counter = FactoryCounter::new();

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let cache = cache.clone();
            let factory = counter.factory("supervisor", Duration::from_millis(50));
            tokio::spawn(async move { cache.get_or_create("u1", "supervisor", factory).await })
        })
        .collect();

    let agents: Vec<Arc<TestAgent>> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().expect("construction should succeed"))
        .collect();

    assert_eq!(counter.count(), 1);
    assert!(agents.iter().all(|agent| Arc::ptr_eq(agent, &agents[0])));
    assert_eq!(cache.size(), 1);

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits + stats.pending_joins, 63);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_key_shares_failure() {
    let cache: AgentCacheManager<TestAgent> = AgentCacheManager::new();
    let counter = FactoryCounter::new();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            let factory = counter.failing("upstream 503", Duration::from_millis(50));
            tokio::spawn(async move { cache.get_or_create("u1", "executor", factory).await })
        })
        .collect();

    let results = join_all(handles).await;

    // Late arrivals may start a fresh attempt after the first one failed,
    // but every caller must see an error and the key must not stay pending.
    assert!(results.into_iter().all(|joined| joined.unwrap().is_err()));
    assert!(counter.count() >= 1);
    assert_eq!(cache.size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_construct_in_parallel() {
    const KEYS: usize = 8;
    let cache: AgentCacheManager<TestAgent> = AgentCacheManager::new();
    // Every factory waits for all the others; serialized construction would deadlock.
    let barrier = Arc::new(Barrier::new(KEYS));

    let handles: Vec<_> = (0..KEYS)
        .map(|i| {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                cache
                    .get_or_create("u1", &format!("agent-{i}"), move || -> AgentFuture {
                        async move {
                            barrier.wait().await;
                            Ok(TestAgent::new(format!("agent-{i}")))
                        }
                        .boxed()
                    })
                    .await
            })
        })
        .collect();

    let results = tokio::time::timeout(Duration::from_secs(5), join_all(handles))
        .await
        .expect("constructions for distinct keys must not serialize");

    assert!(results.into_iter().all(|joined| joined.unwrap().is_ok()));
    assert_eq!(cache.size(), KEYS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_operations_keep_bounds_and_dispose_exactly_once() {
    const USERS: usize = 4;
    const AGENTS: usize = 5;
    let cache: AgentCacheManager<TestAgent> = AgentCacheManager::with_limits(
        CacheLimits::default()
            .with_max_cached_agents(CacheBound::AtMost(6))
            .with_max_cached_agents_per_user(CacheBound::AtMost(2)),
    );
    let built: Arc<StdMutex<Vec<Arc<TestAgent>>>> = Arc::new(StdMutex::new(Vec::new()));

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let cache = cache.clone();
            let built = Arc::clone(&built);
            tokio::spawn(async move {
                let user = format!("user-{}", i % USERS);
                let agent = format!("agent-{}", (i * 7) % AGENTS);
                if i % 9 == 0 {
                    cache.invalidate(&user, &agent).await;
                    return;
                }
                let name = format!("{user}/{agent}");
                let result = cache
                    .get_or_create(&user, &agent, move || -> AgentFuture {
                        async move {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            let agent = TestAgent::new(name);
                            built.lock().unwrap().push(Arc::clone(&agent));
                            Ok(agent)
                        }
                        .boxed()
                    })
                    .await;
                assert!(result.is_ok());
            })
        })
        .collect();

    for joined in join_all(handles).await {
        joined.unwrap();
    }

    assert!(cache.size() <= 6);
    let mut total = 0;
    for u in 0..USERS {
        let held = cache.user_size(&format!("user-{u}"));
        assert!(held <= 2);
        total += held;
    }
    assert_eq!(total, cache.size(), "per-user and global indices must agree");

    let keys: HashSet<String> = cache.entries().into_iter().map(|e| e.key.to_string()).collect();
    assert_eq!(keys.len(), cache.size());

    cache.clear().await;
    assert_eq!(cache.size(), 0);

    let built = built.lock().unwrap();
    assert!(!built.is_empty());
    for agent in built.iter() {
        assert_eq!(
            agent.dispose_count(),
            1,
            "{} should be disposed exactly once",
            agent.name
        );
    }
}

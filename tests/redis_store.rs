//! Integration tests for the Redis counter store.
//!
//! These tests require a Redis instance at `redis://127.0.0.1/` and are
//! ignored by default. Run with `cargo test --test redis_store -- --ignored`.

#![cfg(feature = "redis-store")]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use gatekeeper::ratelimit::{
    CallerContext, CounterStore, Policy, PolicySet, RateLimiter, RedisStore,
};

const REDIS_URL: &str = "redis://127.0.0.1/";

async fn connect() -> Option<RedisStore> {
    match RedisStore::connect(REDIS_URL).await {
        Ok(store) => Some(store),
        Err(e) => {
            eprintln!("Skipping test: Redis not available at {}: {}", REDIS_URL, e);
            None
        }
    }
}

/// Unique key per test run so reruns never see stale counters.
fn test_key(name: &str) -> String {
    format!("gatekeeper-test:{}:{}", name, uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_increment_counts_and_expires() {
    let Some(store) = connect().await else { return };
    let key = test_key("increment");

    assert_eq!(store.increment(&key, Duration::from_millis(300)).await.unwrap(), 1);
    assert_eq!(store.increment(&key, Duration::from_millis(300)).await.unwrap(), 2);
    assert_eq!(store.count(&key).await.unwrap(), 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.count(&key).await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_increment_does_not_extend_ttl() {
    let Some(store) = connect().await else { return };
    let key = test_key("ttl");

    store.increment(&key, Duration::from_millis(500)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    store.increment(&key, Duration::from_millis(500)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Created 600ms ago with a 500ms TTL: gone, despite the second increment.
    assert_eq!(store.count(&key).await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_concurrent_increments_are_linear() {
    let Some(store) = connect().await else { return };
    let key = test_key("concurrent");

    let results = join_all((0..100).map(|_| {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move { store.increment(&key, Duration::from_secs(10)).await.unwrap() })
    }))
    .await;

    let mut counts: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
    counts.sort_unstable();
    assert_eq!(counts, (1..=100).collect::<Vec<u64>>());
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_sliding_log() {
    let Some(store) = connect().await else { return };
    let key = test_key("log");
    let window = Duration::from_secs(10);
    let now = Utc::now();

    for expected in 1..=3 {
        assert_eq!(store.log_and_count(&key, now, window).await.unwrap(), expected);
    }
    assert_eq!(store.log_count(&key, now, window).await.unwrap(), 3);

    let later = now + chrono::Duration::seconds(10);
    assert_eq!(store.log_count(&key, later, window).await.unwrap(), 0);
    assert_eq!(store.log_and_count(&key, later, window).await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_two_limiters_share_quota() {
    let Some(store) = connect().await else { return };
    let store: Arc<dyn CounterStore> = Arc::new(store);
    let prefix = test_key("shared");

    let make = || {
        let mut set = PolicySet::new();
        set.insert(Policy::builder("messages", 3, Duration::from_secs(60)).build().unwrap());
        RateLimiter::new(store.clone(), set).with_key_prefix(prefix.clone())
    };
    let instance_a = make();
    let instance_b = make();
    let caller = CallerContext::new().with_user("u1");

    assert!(instance_a.evaluate("messages", &caller).await.unwrap().allowed);
    assert!(instance_b.evaluate("messages", &caller).await.unwrap().allowed);
    assert!(instance_a.evaluate("messages", &caller).await.unwrap().allowed);

    let denied = instance_b.evaluate("messages", &caller).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.current_count, 4);
}

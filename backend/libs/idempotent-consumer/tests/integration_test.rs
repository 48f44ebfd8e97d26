//! Integration tests for idempotent consumer library
//!
//! These tests verify:
//! 1. Concurrent processing safety (10 parallel consumers, one side effect)
//! 2. Release after failure makes the event eligible again
//! 3. Marker expiry
//! 4. The same behavior against a live Redis
//!
//! Redis tests are ignored by default:
//! ```bash
//! export REDIS_URL="redis://127.0.0.1:6379"
//! cargo test --package idempotent-consumer --test integration_test -- --ignored
//! ```

use futures::future::join_all;
use idempotent_consumer::{
    Claim, DedupStore, IdempotencyError, IdempotencyGuard, InMemoryDedupStore, ProcessingResult,
    RedisDedupStore,
};
use redis_utils::{RedisPool, DEFAULT_COMMAND_TIMEOUT};
use std::env;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn get_redis_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn redis_guard() -> (IdempotencyGuard, Arc<RedisDedupStore>) {
    let pool = RedisPool::connect(&get_redis_url(), DEFAULT_COMMAND_TIMEOUT)
        .await
        .expect("Failed to connect to test Redis");
    let store = Arc::new(RedisDedupStore::new(pool));
    (
        IdempotencyGuard::new(store.clone(), Duration::from_secs(60)),
        store,
    )
}

/// Run `process_if_new` for the same key from 10 tasks and count side effects.
///
/// Losers see either the finished marker or the winner's live claim.
async fn race_same_key(
    guard: IdempotencyGuard,
    event_id: &str,
) -> (u32, Vec<Result<ProcessingResult<()>, IdempotencyError>>) {
    let side_effects = Arc::new(AtomicU32::new(0));

    let tasks = (0..10).map(|_| {
        let guard = guard.clone();
        let side_effects = side_effects.clone();
        let event_id = event_id.to_string();
        tokio::spawn(async move {
            guard
                .process_if_new(&event_id, || async move {
                    sleep(Duration::from_millis(5)).await;
                    side_effects.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                })
                .await
        })
    });

    let results = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.expect("Task panicked"))
        .collect();

    (side_effects.load(Ordering::SeqCst), results)
}

#[tokio::test]
async fn test_concurrent_processing_in_memory() {
    let guard = IdempotencyGuard::new(Arc::new(InMemoryDedupStore::new()), Duration::from_secs(60));

    let (side_effects, results) = race_same_key(guard, "event:race:1").await;

    assert_eq!(side_effects, 1, "Exactly one consumer should process");
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Ok(ProcessingResult::Success(_))))
            .count(),
        1
    );
    let losers = results
        .iter()
        .filter(|r| match r {
            Ok(result) => result.is_duplicate(),
            Err(e) => matches!(e, IdempotencyError::InProgress(_)),
        })
        .count();
    assert_eq!(losers, 9);
}

#[tokio::test]
async fn test_distinct_keys_all_processed() {
    let guard = IdempotencyGuard::new(Arc::new(InMemoryDedupStore::new()), Duration::from_secs(60));

    for i in 0..5 {
        let claim = guard.claim(&format!("event:b:{i}")).await.unwrap();
        assert_eq!(claim, Claim::Acquired);
    }
    assert_eq!(guard.claim("event:b:3").await.unwrap(), Claim::InProgress);

    guard.complete("event:b:3").await.unwrap();
    assert_eq!(guard.claim("event:b:3").await.unwrap(), Claim::Duplicate);
}

#[tokio::test]
async fn test_marker_expires() {
    let store = Arc::new(InMemoryDedupStore::new());
    let guard = IdempotencyGuard::new(store.clone(), Duration::from_millis(30));

    let processed = guard
        .process_if_new("event:ttl:1", || async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap();
    assert!(matches!(processed, ProcessingResult::Success(())));
    assert!(guard.is_processed("event:ttl:1").await.unwrap());
    assert!(store.ttl("event:ttl:1").await.unwrap().is_some());

    sleep(Duration::from_millis(60)).await;

    assert!(!guard.is_processed("event:ttl:1").await.unwrap());
    assert_eq!(guard.claim("event:ttl:1").await.unwrap(), Claim::Acquired);
}

#[tokio::test]
async fn test_invalid_event_id_rejected() {
    let guard = IdempotencyGuard::new(Arc::new(InMemoryDedupStore::new()), Duration::from_secs(60));

    assert!(guard.claim("").await.is_err());
    assert!(guard.is_processed(&"x".repeat(2000)).await.is_err());
}

#[ignore = "Requires Redis"]
#[tokio::test]
async fn test_concurrent_processing_redis() {
    let (guard, store) = redis_guard().await;
    let event_id = format!("test:race:{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));

    let (side_effects, _) = race_same_key(guard, &event_id).await;
    assert_eq!(side_effects, 1);

    store.remove(&event_id).await.expect("Failed to cleanup");
}

#[ignore = "Requires Redis"]
#[tokio::test]
async fn test_release_after_failure_redis() {
    let (guard, store) = redis_guard().await;
    let event_id = "test:release:1";
    store.remove(event_id).await.expect("Failed to cleanup");

    let failed = guard
        .process_if_new(event_id, || async { Err::<(), _>(anyhow::anyhow!("boom")) })
        .await
        .expect("Store error");
    assert!(failed.is_failed());
    assert!(!guard.is_processed(event_id).await.unwrap());

    let ok = guard
        .process_if_new(event_id, || async { Ok::<_, anyhow::Error>(()) })
        .await
        .expect("Store error");
    assert!(matches!(ok, ProcessingResult::Success(())));

    let ttl = store.ttl(event_id).await.unwrap().expect("marker missing");
    assert!(ttl <= Duration::from_secs(60));
    assert!(guard.first_seen(event_id).await.unwrap().is_some());

    store.remove(event_id).await.expect("Failed to cleanup");
}

//! # Idempotent Kafka Consumer Library
//!
//! Exactly-one side effect per event key for at-least-once Kafka consumers.
//! Duplicates come from redelivery after a crash, from rebalances, and from
//! the same key arriving on two partitions at once. All of them are filtered
//! by a Dedup Marker kept in a shared key-value store.
//!
//! ## Claim, then process
//!
//! ```text
//! record ──► claim(key) ──SET NX "pending:ts" PX lease──► store
//!               │ won                         │ lost
//!               ▼                             ▼
//!          process(record)          pending? ── yes ──► InProgress (retry later)
//!          ok │     │ err                     │ no
//!             ▼     ▼                         ▼
//!  SET XX "ts" PX ttl   release(key)     AlreadyProcessed
//! ```
//!
//! The check and the write are the same command, so when ten consumers see
//! the same key exactly one of them wins the claim. The claim is only a short
//! lease: the marker gets its full TTL once processing succeeded. If the
//! winner crashes, or fails and cannot release, the lease runs out and a
//! redelivery processes the event again instead of dropping it.
//!
//! ## Usage
//!
//! ```ignore
//! use idempotent_consumer::{IdempotencyGuard, ProcessingResult, RedisDedupStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(pool: redis_utils::RedisPool) -> anyhow::Result<()> {
//! let store = Arc::new(RedisDedupStore::new(pool));
//! let guard = IdempotencyGuard::new(store, Duration::from_secs(3600));
//!
//! match guard.process_if_new("event:batch-7:1042", || async {
//!     stage_record().await
//! }).await? {
//!     ProcessingResult::Success(()) => {}
//!     ProcessingResult::AlreadyProcessed => {}
//!     ProcessingResult::Unguarded(()) => {}
//!     ProcessingResult::Failed(err) => return Err(err),
//! }
//! # Ok(())
//! # }
//! # async fn stage_record() -> anyhow::Result<()> { Ok(()) }
//! ```
//!
//! ## Store outages
//!
//! [`DedupFailurePolicy`] decides what a claim does when the store cannot be
//! reached. `Closed` (the default) surfaces the error so the caller retries
//! later without committing. `Open` processes the event without a marker and
//! reports [`ProcessingResult::Unguarded`], accepting possible duplicates.

use chrono::{DateTime, TimeZone, Utc};
use resilience::{with_retry, RetryConfig};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

mod error;
mod store;

pub use error::{IdempotencyError, IdempotencyResult};
pub use store::{DedupStore, InMemoryDedupStore, RedisDedupStore};

/// Longest accepted event key, in bytes
pub const MAX_EVENT_ID_LEN: usize = 1024;

/// Default lifetime of a claim that has not completed yet
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(30);

const PENDING_PREFIX: &str = "pending:";

/// What a claim does when the marker store is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupFailurePolicy {
    /// Process without a marker; duplicates become possible
    Open,
    /// Fail the claim; the caller retries and must not commit
    #[default]
    Closed,
}

impl FromStr for DedupFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "fail-open" | "fail_open" => Ok(Self::Open),
            "closed" | "fail-closed" | "fail_closed" => Ok(Self::Closed),
            other => Err(format!("unknown dedup failure policy: {other}")),
        }
    }
}

/// Outcome of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller set the marker and owns the event
    Acquired,
    /// A completed marker already existed
    Duplicate,
    /// Another delivery holds an unexpired claim and has not finished
    InProgress,
    /// Store unreachable under [`DedupFailurePolicy::Open`]; no marker was set
    Unguarded,
}

/// Result of processing an event with idempotency check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult<T, E = anyhow::Error> {
    /// Event was processed for the first time; its marker is kept
    Success(T),

    /// Event was already processed before (duplicate)
    AlreadyProcessed,

    /// Event was processed without a marker (fail-open store outage)
    Unguarded(T),

    /// Processing failed; the claim was released
    Failed(E),
}

impl<T, E> ProcessingResult<T, E> {
    /// Processed now or earlier
    pub fn is_ok(&self) -> bool {
        !self.is_failed()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ProcessingResult::Failed(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ProcessingResult::AlreadyProcessed)
    }
}

/// Idempotency guard over a shared [`DedupStore`].
///
/// Cheap to clone; share one per service.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn DedupStore>,
    marker_ttl: Duration,
    pending_ttl: Duration,
    policy: DedupFailurePolicy,
    release_retry: RetryConfig,
}

impl IdempotencyGuard {
    /// Guard with the default fail-closed policy.
    ///
    /// `marker_ttl` should outlive every redelivery window of the source
    /// topics, otherwise a late duplicate is processed again.
    pub fn new(store: Arc<dyn DedupStore>, marker_ttl: Duration) -> Self {
        Self {
            store,
            marker_ttl,
            pending_ttl: DEFAULT_PENDING_TTL,
            policy: DedupFailurePolicy::default(),
            release_retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(500),
                ..Default::default()
            },
        }
    }

    pub fn with_policy(mut self, policy: DedupFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How long an unfinished claim blocks other deliveries of the same key.
    ///
    /// Should exceed the longest processing run; a crashed or stuck holder
    /// loses the event to the next delivery after this long.
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn with_release_retry(mut self, config: RetryConfig) -> Self {
        self.release_retry = config;
        self
    }

    pub fn policy(&self) -> DedupFailurePolicy {
        self.policy
    }

    pub fn marker_ttl(&self) -> Duration {
        self.marker_ttl
    }

    pub fn pending_ttl(&self) -> Duration {
        self.pending_ttl
    }

    /// Whether a completed marker exists for `event_id`
    pub async fn is_processed(&self, event_id: &str) -> IdempotencyResult<bool> {
        Self::validate_event_id(event_id)?;

        let processed = matches!(
            self.store.get(event_id).await?,
            Some(v) if !v.starts_with(PENDING_PREFIX)
        );
        if processed {
            debug!(event_id = %event_id, "Event already processed");
        }
        Ok(processed)
    }

    /// When the event was first claimed, if a marker exists
    pub async fn first_seen(&self, event_id: &str) -> IdempotencyResult<Option<DateTime<Utc>>> {
        Self::validate_event_id(event_id)?;

        let value = self.store.get(event_id).await?;
        Ok(value
            .and_then(|v| v.trim_start_matches(PENDING_PREFIX).parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }

    /// Atomically take a short claim on `event_id` if no marker exists.
    ///
    /// The claim expires after the pending TTL unless [`complete`] turns it
    /// into a full marker.
    ///
    /// [`complete`]: IdempotencyGuard::complete
    pub async fn claim(&self, event_id: &str) -> IdempotencyResult<Claim> {
        Self::validate_event_id(event_id)?;

        let pending = format!("{PENDING_PREFIX}{}", Utc::now().timestamp_millis());
        match self
            .store
            .set_if_absent(event_id, &pending, self.pending_ttl)
            .await
        {
            Ok(true) => {
                debug!(event_id = %event_id, "Claimed event");
                Ok(Claim::Acquired)
            }
            Ok(false) => match self.store.get(event_id).await? {
                Some(v) if !v.starts_with(PENDING_PREFIX) => {
                    debug!(event_id = %event_id, "Event already processed (duplicate)");
                    Ok(Claim::Duplicate)
                }
                // pending, or expired since the SET
                _ => {
                    debug!(event_id = %event_id, "Event claimed by another delivery");
                    Ok(Claim::InProgress)
                }
            },
            Err(e) if self.policy == DedupFailurePolicy::Open => {
                warn!(
                    event_id = %event_id,
                    error = %e,
                    "Dedup store unavailable, processing without marker"
                );
                Ok(Claim::Unguarded)
            }
            Err(e) => Err(e),
        }
    }

    /// Turn the claim on `event_id` into a marker that lives for the full TTL.
    ///
    /// The claim timestamp is kept as the marker value. If the claim already
    /// ran out the marker is written fresh.
    pub async fn complete(&self, event_id: &str) -> IdempotencyResult<()> {
        Self::validate_event_id(event_id)?;

        let current = self.store.get(event_id).await?;
        let first_seen = current
            .as_deref()
            .map(|v| v.trim_start_matches(PENDING_PREFIX).to_string())
            .unwrap_or_else(|| Utc::now().timestamp_millis().to_string());

        if self
            .store
            .replace(event_id, &first_seen, self.marker_ttl)
            .await?
        {
            return Ok(());
        }

        warn!(event_id = %event_id, "Claim expired before completion");
        self.store
            .set_if_absent(event_id, &first_seen, self.marker_ttl)
            .await?;
        Ok(())
    }

    /// Remove the marker so the event can be processed again.
    ///
    /// Retried a few times: a marker left behind after a failed processing
    /// would turn the next delivery into a silent drop.
    pub async fn release(&self, event_id: &str) -> IdempotencyResult<bool> {
        Self::validate_event_id(event_id)?;

        let store = self.store.clone();
        let removed = with_retry(self.release_retry.clone(), || {
            let store = store.clone();
            async move { store.remove(event_id).await }
        })
        .await
        .map_err(|e| {
            let e = e.into_inner();
            error!(event_id = %event_id, error = %e, "Failed to release dedup marker");
            e
        })?;

        if removed {
            info!(event_id = %event_id, "Released dedup marker");
        }
        Ok(removed)
    }

    /// Run `f` only if `event_id` has not been processed before.
    ///
    /// A claim is taken before `f` runs. It becomes the full marker when `f`
    /// succeeds and is released when `f` fails, so concurrent callers with
    /// the same key execute `f` at most once between them, and a failure
    /// leaves the event eligible for another attempt.
    ///
    /// Returns [`IdempotencyError::InProgress`] while another delivery holds
    /// the claim. Store errors during the claim follow the configured policy.
    /// A store error while completing or releasing is returned as `Err`; the
    /// claim then expires on its own and a redelivery runs `f` again.
    pub async fn process_if_new<F, Fut, T, E>(
        &self,
        event_id: &str,
        f: F,
    ) -> IdempotencyResult<ProcessingResult<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match self.claim(event_id).await? {
            Claim::Duplicate => Ok(ProcessingResult::AlreadyProcessed),
            Claim::InProgress => Err(IdempotencyError::InProgress(event_id.to_string())),
            Claim::Unguarded => match f().await {
                Ok(value) => Ok(ProcessingResult::Unguarded(value)),
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "Event processing failed");
                    Ok(ProcessingResult::Failed(e))
                }
            },
            Claim::Acquired => match f().await {
                Ok(value) => {
                    self.complete(event_id).await?;
                    Ok(ProcessingResult::Success(value))
                }
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "Event processing failed");
                    self.release(event_id).await?;
                    Ok(ProcessingResult::Failed(e))
                }
            },
        }
    }

    fn validate_event_id(event_id: &str) -> IdempotencyResult<()> {
        if event_id.is_empty() {
            return Err(IdempotencyError::InvalidEventId(
                "Event ID cannot be empty".to_string(),
            ));
        }

        if event_id.len() > MAX_EVENT_ID_LEN {
            return Err(IdempotencyError::InvalidEventId(format!(
                "Event ID too long: {} characters (max {})",
                event_id.len(),
                MAX_EVENT_ID_LEN
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Store that fails every command, as Redis does while unreachable
    struct DownStore;

    #[async_trait]
    impl DedupStore for DownStore {
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> IdempotencyResult<bool> {
            Err(down())
        }
        async fn replace(&self, _: &str, _: &str, _: Duration) -> IdempotencyResult<bool> {
            Err(down())
        }
        async fn exists(&self, _: &str) -> IdempotencyResult<bool> {
            Err(down())
        }
        async fn get(&self, _: &str) -> IdempotencyResult<Option<String>> {
            Err(down())
        }
        async fn remove(&self, _: &str) -> IdempotencyResult<bool> {
            Err(down())
        }
        async fn ttl(&self, _: &str) -> IdempotencyResult<Option<Duration>> {
            Err(down())
        }
    }

    /// Working store whose deletes fail, so a claim cannot be released
    struct NoReleaseStore(InMemoryDedupStore);

    #[async_trait]
    impl DedupStore for NoReleaseStore {
        async fn set_if_absent(&self, k: &str, v: &str, ttl: Duration) -> IdempotencyResult<bool> {
            self.0.set_if_absent(k, v, ttl).await
        }
        async fn replace(&self, k: &str, v: &str, ttl: Duration) -> IdempotencyResult<bool> {
            self.0.replace(k, v, ttl).await
        }
        async fn exists(&self, k: &str) -> IdempotencyResult<bool> {
            self.0.exists(k).await
        }
        async fn get(&self, k: &str) -> IdempotencyResult<Option<String>> {
            self.0.get(k).await
        }
        async fn remove(&self, _: &str) -> IdempotencyResult<bool> {
            Err(down())
        }
        async fn ttl(&self, k: &str) -> IdempotencyResult<Option<Duration>> {
            self.0.ttl(k).await
        }
    }

    fn down() -> IdempotencyError {
        IdempotencyError::Store(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )))
    }

    fn memory_guard() -> IdempotencyGuard {
        IdempotencyGuard::new(Arc::new(InMemoryDedupStore::new()), Duration::from_secs(60))
    }

    #[test]
    fn test_validate_event_id() {
        assert!(IdempotencyGuard::validate_event_id("event-123").is_ok());
        assert!(IdempotencyGuard::validate_event_id(&"x".repeat(MAX_EVENT_ID_LEN)).is_ok());

        let err = IdempotencyGuard::validate_event_id("").unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidEventId(_)));

        let err = IdempotencyGuard::validate_event_id(&"x".repeat(MAX_EVENT_ID_LEN + 1))
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidEventId(_)));
    }

    #[test]
    fn test_processing_result() {
        assert!(ProcessingResult::<(), String>::Success(()).is_ok());
        assert!(ProcessingResult::<(), String>::AlreadyProcessed.is_ok());
        assert!(ProcessingResult::<(), String>::AlreadyProcessed.is_duplicate());
        assert!(ProcessingResult::<(), String>::Failed("boom".into()).is_failed());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("open".parse(), Ok(DedupFailurePolicy::Open));
        assert_eq!("FAIL-CLOSED".parse(), Ok(DedupFailurePolicy::Closed));
        assert!("maybe".parse::<DedupFailurePolicy>().is_err());
        assert_eq!(DedupFailurePolicy::default(), DedupFailurePolicy::Closed);
    }

    #[tokio::test]
    async fn test_second_processing_is_noop() {
        let guard = memory_guard();
        let runs = AtomicU32::new(0);
        let runs_ref = &runs;

        let first = guard
            .process_if_new("event:b1:1", move || async move {
                runs_ref.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap();
        assert_eq!(first, ProcessingResult::Success(()));

        let second = guard
            .process_if_new("event:b1:1", move || async move {
                runs_ref.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap();
        assert_eq!(second, ProcessingResult::AlreadyProcessed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(guard.first_seen("event:b1:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_releases_marker() {
        let guard = memory_guard();

        let result = guard
            .process_if_new("event:b1:2", || async { Err::<(), _>("mapping failed") })
            .await
            .unwrap();
        assert!(result.is_failed());
        assert!(!guard.is_processed("event:b1:2").await.unwrap());

        let retry = guard
            .process_if_new("event:b1:2", || async { Ok::<_, String>(5) })
            .await
            .unwrap();
        assert_eq!(retry, ProcessingResult::Success(5));
    }

    #[tokio::test]
    async fn test_fail_closed_surfaces_store_error() {
        let guard = IdempotencyGuard::new(Arc::new(DownStore), Duration::from_secs(60));
        let ran = AtomicBool::new(false);
        let ran_ref = &ran;

        let err = guard
            .process_if_new("event:b1:3", move || async move {
                ran_ref.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fail_open_processes_unguarded() {
        let guard = IdempotencyGuard::new(Arc::new(DownStore), Duration::from_secs(60))
            .with_policy(DedupFailurePolicy::Open);

        let result = guard
            .process_if_new("event:b1:4", || async { Ok::<_, String>(1) })
            .await
            .unwrap();
        assert_eq!(result, ProcessingResult::Unguarded(1));
    }

    #[tokio::test]
    async fn test_success_promotes_claim_to_full_ttl() {
        let store = Arc::new(InMemoryDedupStore::new());
        let guard = IdempotencyGuard::new(store.clone(), Duration::from_secs(3600))
            .with_pending_ttl(Duration::from_millis(50));

        let result = guard
            .process_if_new("event:b1:5", || async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert_eq!(result, ProcessingResult::Success(()));

        let ttl = store.ttl("event:b1:5").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(60));
        assert!(guard.is_processed("event:b1:5").await.unwrap());
        assert!(guard.first_seen("event:b1:5").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreleased_claim_is_retried_not_dropped() {
        let store = Arc::new(NoReleaseStore(InMemoryDedupStore::new()));
        let guard = IdempotencyGuard::new(store, Duration::from_secs(3600))
            .with_pending_ttl(Duration::from_millis(40))
            .with_release_retry(RetryConfig {
                max_retries: 0,
                ..Default::default()
            });
        let staged = AtomicBool::new(false);
        let staged_ref = &staged;

        let err = guard
            .process_if_new("mention:b1:7", || async { Err::<(), _>("staging failed") })
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // the claim is still held: come back later, do not skip the record
        let err = guard
            .process_if_new("mention:b1:7", move || async move {
                staged_ref.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::InProgress(_)));
        assert!(err.is_transient());
        assert!(!staged.load(Ordering::SeqCst));
        assert!(!guard.is_processed("mention:b1:7").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = guard
            .process_if_new("mention:b1:7", move || async move {
                staged_ref.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap();
        assert_eq!(result, ProcessingResult::Success(()));
        assert!(staged.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_abandoned_claim_expires() {
        let guard = memory_guard().with_pending_ttl(Duration::from_millis(30));

        // holder died between claim and completion
        assert_eq!(guard.claim("event:b1:6").await.unwrap(), Claim::Acquired);
        assert_eq!(guard.claim("event:b1:6").await.unwrap(), Claim::InProgress);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(guard.claim("event:b1:6").await.unwrap(), Claim::Acquired);
    }
}

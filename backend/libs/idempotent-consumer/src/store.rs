//! Marker stores
//!
//! A [`DedupStore`] holds one key per processed event. The only mutation the
//! guard performs on a marker is the conditional `set_if_absent`, so two
//! consumers racing on the same key can never both win.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis_utils::{with_timeout, RedisPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::error::{IdempotencyError, IdempotencyResult};

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically set `key` to `value` with `ttl` if it does not exist.
    ///
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> IdempotencyResult<bool>;

    /// Overwrite `key` with `value` and a new `ttl` only if it exists.
    ///
    /// Returns `true` when the key was present and updated.
    async fn replace(&self, key: &str, value: &str, ttl: Duration) -> IdempotencyResult<bool>;

    async fn exists(&self, key: &str) -> IdempotencyResult<bool>;

    /// Value stored under `key`, if any
    async fn get(&self, key: &str) -> IdempotencyResult<Option<String>>;

    /// Delete `key`; returns whether it existed
    async fn remove(&self, key: &str) -> IdempotencyResult<bool>;

    /// Remaining time to live, `None` if the key does not exist
    async fn ttl(&self, key: &str) -> IdempotencyResult<Option<Duration>>;
}

/// Redis-backed marker store using `SET key value NX PX ttl`
#[derive(Clone)]
pub struct RedisDedupStore {
    pool: RedisPool,
}

impl RedisDedupStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> IdempotencyResult<bool> {
        let mut conn = self.pool.connection().await;
        let ttl_ms = usize::try_from(ttl.as_millis()).unwrap_or(usize::MAX).max(1);

        // SET replies OK when the key was written and nil when NX rejected it
        let reply: Option<String> = with_timeout(
            self.pool.command_timeout(),
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn),
        )
        .await
        .map_err(|e| {
            error!(key = %key, error = %e, "Failed to set dedup marker");
            IdempotencyError::Store(e)
        })?;

        Ok(reply.is_some())
    }

    async fn replace(&self, key: &str, value: &str, ttl: Duration) -> IdempotencyResult<bool> {
        let mut conn = self.pool.connection().await;
        let ttl_ms = usize::try_from(ttl.as_millis()).unwrap_or(usize::MAX).max(1);

        let reply: Option<String> = with_timeout(
            self.pool.command_timeout(),
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("XX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn),
        )
        .await
        .map_err(|e| {
            error!(key = %key, error = %e, "Failed to complete dedup marker");
            IdempotencyError::Store(e)
        })?;

        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> IdempotencyResult<bool> {
        let mut conn = self.pool.connection().await;
        let exists: bool = with_timeout(self.pool.command_timeout(), conn.exists(key)).await?;
        Ok(exists)
    }

    async fn get(&self, key: &str) -> IdempotencyResult<Option<String>> {
        let mut conn = self.pool.connection().await;
        let value: Option<String> =
            with_timeout(self.pool.command_timeout(), conn.get(key)).await?;
        Ok(value)
    }

    async fn remove(&self, key: &str) -> IdempotencyResult<bool> {
        let mut conn = self.pool.connection().await;
        let deleted: u32 = with_timeout(self.pool.command_timeout(), conn.del(key)).await?;
        Ok(deleted > 0)
    }

    async fn ttl(&self, key: &str) -> IdempotencyResult<Option<Duration>> {
        let mut conn = self.pool.connection().await;
        let ttl_ms: i64 = with_timeout(self.pool.command_timeout(), conn.pttl(key)).await?;

        // -2: key does not exist, -1: key has no expiry
        match ttl_ms {
            -2 => Ok(None),
            -1 => Ok(Some(Duration::MAX)),
            n if n >= 0 => Ok(Some(Duration::from_millis(n as u64))),
            _ => Ok(None),
        }
    }
}

/// In-process marker store with the same NX/TTL semantics as Redis.
///
/// Used by tests and by single-instance deployments without Redis.
#[derive(Clone, Default)]
pub struct InMemoryDedupStore {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live markers
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|(_, exp)| *exp > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> IdempotencyResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }

        let expires_at = now.checked_add(ttl).unwrap_or_else(far_future);
        entries.insert(key.to_string(), (value.to_string(), expires_at));
        debug!(key = %key, "In-memory marker set");
        Ok(true)
    }

    async fn replace(&self, key: &str, value: &str, ttl: Duration) -> IdempotencyResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        match entries.get_mut(key) {
            Some(entry) if entry.1 > now => {
                *entry = (
                    value.to_string(),
                    now.checked_add(ttl).unwrap_or_else(far_future),
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> IdempotencyResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn get(&self, key: &str) -> IdempotencyResult<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, exp)| *exp > now)
            .map(|(v, _)| v.clone()))
    }

    async fn remove(&self, key: &str) -> IdempotencyResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(entries
            .remove(key)
            .map(|(_, exp)| exp > now)
            .unwrap_or(false))
    }

    async fn ttl(&self, key: &str) -> IdempotencyResult<Option<Duration>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, exp)| *exp > now)
            .map(|(_, exp)| exp.duration_since(now)))
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(100 * 365 * 24 * 3600)
}

//! Key-value store client for batch state and staged records
//!
//! Every mutation the batch logic needs from Redis is a single command, so
//! concurrent workers and instances never do read-modify-write on a key.

use async_trait::async_trait;
use redis::{ErrorKind, RedisError};
use redis_utils::{with_timeout, RedisPool};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::Result;

#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional write, optionally with a TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomic write only when `key` does not exist; `true` when written
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Set a TTL on an existing key; `false` when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Atomically move `member` between sets; `false` when it was not in `src`
    async fn set_move(&self, src: &str, dst: &str, member: &str) -> Result<bool>;

    /// Remove and return an arbitrary member
    async fn set_pop(&self, key: &str) -> Result<Option<String>>;
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis implementation over the shared connection manager
#[derive(Clone)]
pub struct RedisCache {
    pool: RedisPool,
}

impl RedisCache {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T> {
        let mut conn = self.pool.connection().await;
        let value = with_timeout(self.pool.command_timeout(), cmd.query_async(&mut conn)).await?;
        Ok(value)
    }
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("GET").arg(key).clone()).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        self.query::<()>(cmd).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(ttl_millis(ttl));
        let reply: Option<String> = self.query(cmd).await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl_millis(ttl));
        self.query(cmd).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.query(cmd).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        let added: u64 = self.query(cmd).await?;
        Ok(added > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(member);
        let removed: u64 = self.query(cmd).await?;
        Ok(removed > 0)
    }

    async fn set_move(&self, src: &str, dst: &str, member: &str) -> Result<bool> {
        let mut cmd = redis::cmd("SMOVE");
        cmd.arg(src).arg(dst).arg(member);
        self.query(cmd).await
    }

    async fn set_pop(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("SPOP");
        cmd.arg(key);
        self.query(cmd).await
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// In-process store with Redis semantics, for tests and local runs.
///
/// `set_unavailable(true)` makes every command fail like a dropped Redis
/// connection.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Live keys, for assertions
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remaining TTL of a live key; `None` for missing or persistent keys
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|e| e.live(now))
            .and_then(|e| e.expires_at)
            .map(|exp| exp.duration_since(now))
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RedisError::from((ErrorKind::IoError, "connection refused")).into());
        }
        Ok(())
    }

    async fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T> + Send,
    ) -> Result<T> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.live(now));
        f(&mut entries)
    }
}

fn wrong_type() -> crate::error::ProcessorError {
    RedisError::from((
        ErrorKind::TypeError,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    ))
    .into()
}

fn set_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut BTreeSet<String>> {
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Set(BTreeSet::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::Set(set) => Ok(set),
        Value::Str(_) => Err(wrong_type()),
    }
}

fn drop_if_empty(entries: &mut HashMap<String, Entry>, key: &str) {
    if matches!(entries.get(key), Some(Entry { value: Value::Set(s), .. }) if s.is_empty()) {
        entries.remove(key);
    }
}

#[async_trait]
impl CacheClient for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type()),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at,
                },
            );
            Ok(())
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let expires_at = Some(Instant::now() + ttl);
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at,
                },
            );
            Ok(true)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let expires_at = Some(Instant::now() + ttl);
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.with_entries(|entries| {
            Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count() as u64)
        })
        .await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        self.with_entries(|entries| Ok(set_mut(entries, key)?.insert(member.to_string())))
            .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(wrong_type()),
        })
        .await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.with_entries(|entries| {
            if !entries.contains_key(key) {
                return Ok(false);
            }
            let removed = set_mut(entries, key)?.remove(member);
            drop_if_empty(entries, key);
            Ok(removed)
        })
        .await
    }

    async fn set_move(&self, src: &str, dst: &str, member: &str) -> Result<bool> {
        self.with_entries(|entries| {
            if !entries.contains_key(src) {
                return Ok(false);
            }
            if !set_mut(entries, src)?.remove(member) {
                drop_if_empty(entries, src);
                return Ok(false);
            }
            drop_if_empty(entries, src);
            set_mut(entries, dst)?.insert(member.to_string());
            Ok(true)
        })
        .await
    }

    async fn set_pop(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| {
            if !entries.contains_key(key) {
                return Ok(None);
            }
            let set = set_mut(entries, key)?;
            let popped = set.iter().next().cloned();
            if let Some(member) = &popped {
                set.remove(member);
            }
            drop_if_empty(entries, key);
            Ok(popped)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_is_conditional() {
        let cache = InMemoryCache::new();
        assert!(cache.set_if_absent("k", "1", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.set_if_absent("k", "2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_expiry() {
        let cache = InMemoryCache::new();
        cache.set("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        cache.set_add("s", "a").await.unwrap();
        assert!(cache.expire("s", Duration::from_millis(20)).await.unwrap());
        assert!(!cache.expire("missing", Duration::from_secs(1)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.set_members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_operations() {
        let cache = InMemoryCache::new();
        assert!(cache.set_add("active", "b1").await.unwrap());
        assert!(!cache.set_add("active", "b1").await.unwrap());
        cache.set_add("active", "b2").await.unwrap();

        assert!(cache.set_move("active", "ready", "b1").await.unwrap());
        assert!(!cache.set_move("active", "ready", "b1").await.unwrap());
        assert_eq!(cache.set_members("active").await.unwrap(), vec!["b2"]);

        assert_eq!(cache.set_pop("ready").await.unwrap().as_deref(), Some("b1"));
        assert_eq!(cache.set_pop("ready").await.unwrap(), None);

        assert!(cache.set_remove("active", "b2").await.unwrap());
        assert!(cache.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let cache = InMemoryCache::new();
        cache.set("k", "v", None).await.unwrap();
        assert!(cache.set_add("k", "m").await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_is_transient() {
        let cache = InMemoryCache::new();
        cache.set_unavailable(true);
        let err = cache.get("k").await.unwrap_err();
        assert!(err.is_transient());

        cache.set_unavailable(false);
        assert!(cache.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_counts_existing() {
        let cache = InMemoryCache::new();
        cache.set("a", "1", None).await.unwrap();
        let deleted = cache
            .delete(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }
}

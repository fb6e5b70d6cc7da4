//! Byte-level cache backend: Redis (shared) or an in-process map (single instance).

use deadpool_redis::Pool;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Errors surfaced by cache operations.
///
/// Callers on the read path log these and fall through to the store;
/// they never reach API consumers.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        CacheError::Pool(e.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Command(e.to_string())
    }
}

#[derive(Debug, Clone)]
enum LocalValue {
    Bytes(Arc<Vec<u8>>),
    List(Vec<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: LocalValue,
    expires_at: Instant,
}

impl LocalEntry {
    fn new(value: LocalValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process store with Redis-like semantics for strings and lists.
///
/// One mutex over the whole map keeps multi-key batches atomic.
#[derive(Debug, Default)]
pub struct LocalCache {
    entries: Mutex<HashMap<String, LocalEntry>>,
}

impl LocalCache {
    fn live<'a>(
        entries: &'a mut HashMap<String, LocalEntry>,
        key: &str,
    ) -> Option<&'a mut LocalEntry> {
        if entries.get(key).is_some_and(LocalEntry::is_expired) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.is_expired());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves Redis-style inclusive `start..=stop` (negative counts from the end)
/// against a list of `len` items.
fn normalize_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Cache backend shared by every repository.
///
/// - **Local**: single-instance mode, entries live in this process
/// - **Redis**: multi-instance mode, entries live in Redis via a deadpool pool
#[derive(Clone)]
pub enum CacheBackend {
    Local(Arc<LocalCache>),
    Redis(Pool),
}

impl std::fmt::Debug for CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CacheBackend").field(&self.mode()).finish()
    }
}

impl CacheBackend {
    /// Create a new local-only cache backend.
    pub fn new_local() -> Self {
        CacheBackend::Local(Arc::new(LocalCache::default()))
    }

    /// Create a new Redis-backed cache backend.
    pub fn new_redis(pool: Pool) -> Self {
        CacheBackend::Redis(pool)
    }

    pub fn mode(&self) -> &'static str {
        match self {
            CacheBackend::Local(_) => "local",
            CacheBackend::Redis(_) => "redis",
        }
    }

    /// Read a string value. `Ok(None)` is a miss.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self {
            CacheBackend::Local(cache) => {
                let mut entries = cache.entries.lock();
                Ok(LocalCache::live(&mut entries, key).and_then(|e| match &e.value {
                    LocalValue::Bytes(data) => Some(data.as_ref().clone()),
                    LocalValue::List(_) => None,
                }))
            }
            CacheBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
            }
        }
    }

    /// Write a string value with expiry.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        match self {
            CacheBackend::Local(cache) => {
                cache.entries.lock().insert(
                    key.to_string(),
                    LocalEntry::new(LocalValue::Bytes(Arc::new(value)), ttl),
                );
                Ok(())
            }
            CacheBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await?;
                Ok(())
            }
        }
    }

    /// Write several string values with one expiry, all or nothing.
    pub async fn set_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        match self {
            CacheBackend::Local(cache) => {
                let mut map = cache.entries.lock();
                for (key, value) in entries {
                    map.insert(key, LocalEntry::new(LocalValue::Bytes(Arc::new(value)), ttl));
                }
                Ok(())
            }
            CacheBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                let mut pipe = redis::pipe();
                pipe.atomic();
                for (key, value) in entries {
                    pipe.pset_ex(key, value, ttl_millis(ttl)).ignore();
                }
                let () = pipe.query_async(&mut conn).await?;
                Ok(())
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            CacheBackend::Local(cache) => {
                cache.entries.lock().remove(key);
                Ok(())
            }
            CacheBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                conn.del::<_, ()>(key).await?;
                Ok(())
            }
        }
    }

    pub async fn delete_many(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        match self {
            CacheBackend::Local(cache) => {
                let mut map = cache.entries.lock();
                for key in keys {
                    map.remove(key);
                }
                Ok(())
            }
            CacheBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                conn.del::<_, ()>(keys).await?;
                Ok(())
            }
        }
    }

    /// Append to a list only if it is already cached. Returns whether the append happened.
    pub async fn list_append_if_exists(&self, key: &str, value: Vec<u8>) -> Result<bool, CacheError> {
        match self {
            CacheBackend::Local(cache) => {
                let mut entries = cache.entries.lock();
                match LocalCache::live(&mut entries, key).map(|e| &mut e.value) {
                    Some(LocalValue::List(items)) => {
                        items.push(value);
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
            CacheBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                let len: usize = conn.rpush_exists(key, value).await?;
                Ok(len > 0)
            }
        }
    }

    /// Replace a list wholesale. An empty list removes the key.
    pub async fn list_replace(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        match self {
            CacheBackend::Local(cache) => {
                let mut map = cache.entries.lock();
                if values.is_empty() {
                    map.remove(key);
                } else {
                    map.insert(key.to_string(), LocalEntry::new(LocalValue::List(values), ttl));
                }
                Ok(())
            }
            CacheBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                let mut pipe = redis::pipe();
                pipe.atomic().del(key).ignore();
                if !values.is_empty() {
                    pipe.rpush(key, values).ignore();
                    pipe.pexpire(key, ttl_millis(ttl) as i64).ignore();
                }
                let () = pipe.query_async(&mut conn).await?;
                Ok(())
            }
        }
    }

    /// Read `start..=stop` of a cached list (negative indices count from the end).
    ///
    /// `Ok(None)` means the list is not cached, as opposed to cached but out of range.
    pub async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Option<Vec<Vec<u8>>>, CacheError> {
        match self {
            CacheBackend::Local(cache) => {
                let mut entries = cache.entries.lock();
                match LocalCache::live(&mut entries, key).map(|e| &e.value) {
                    Some(LocalValue::List(items)) => Ok(Some(
                        normalize_range(items.len(), start, stop)
                            .map(|(from, to)| items[from..=to].to_vec())
                            .unwrap_or_default(),
                    )),
                    _ => Ok(None),
                }
            }
            CacheBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                let (exists, items): (bool, Vec<Vec<u8>>) = redis::pipe()
                    .exists(key)
                    .lrange(key, start, stop)
                    .query_async(&mut conn)
                    .await?;
                Ok(exists.then_some(items))
            }
        }
    }

    /// Remaining time to live of a key, `None` if absent.
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        match self {
            CacheBackend::Local(cache) => {
                let mut entries = cache.entries.lock();
                Ok(LocalCache::live(&mut entries, key)
                    .map(|e| e.expires_at.saturating_duration_since(Instant::now())))
            }
            CacheBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                let millis: i64 = conn.pttl(key).await?;
                // -2: missing, -1: no expiry
                Ok(match millis {
                    -2 => None,
                    m if m < 0 => Some(Duration::MAX),
                    m => Some(Duration::from_millis(m as u64)),
                })
            }
        }
    }

    /// Check if Redis is reachable (for health checks).
    pub async fn is_redis_available(&self) -> bool {
        match self {
            CacheBackend::Local(_) => false,
            CacheBackend::Redis(pool) => match pool.get().await {
                Ok(mut conn) => {
                    let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                    pong.is_ok()
                }
                Err(_) => false,
            },
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

//! Named, short-lived mutual-exclusion leases.
//!
//! A lease is proven by a random token; only the token holder may refresh or
//! release it. Redis mode uses `SET NX PX` plus compare-and-delete scripts so
//! leases are shared across instances; local mode keeps them in a `DashMap`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use deadpool_redis::Pool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const REFRESH_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Every attempt found the lock held by someone else.
    #[error("lock {key} is held by another owner")]
    Busy { key: String },

    /// The backing store failed; says nothing about who holds the lock.
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),

    /// The lease expired or was taken over.
    #[error("lock {key} is not held by this lease")]
    NotHeld { key: String },
}

impl From<deadpool_redis::PoolError> for LockError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        LockError::Unavailable(e.to_string())
    }
}

impl From<redis::RedisError> for LockError {
    fn from(e: redis::RedisError) -> Self {
        LockError::Unavailable(e.to_string())
    }
}

/// Proof of ownership of one lock key.
#[derive(Debug, Clone)]
pub struct Lease {
    key: String,
    token: String,
    ttl: Duration,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Linear retry policy for contended locks.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for RetryPolicy {
    fn from(config: &LockConfig) -> Self {
        Self {
            interval: config.retry_interval(),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

#[derive(Debug)]
struct LocalLease {
    token: String,
    expires_at: Instant,
}

#[derive(Clone)]
enum LockBackend {
    Local(Arc<DashMap<String, LocalLease>>),
    Redis(Pool),
}

/// Lock manager used to serialize cache repopulation.
#[derive(Clone)]
pub struct LockManager {
    backend: LockBackend,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.backend {
            LockBackend::Local(_) => "local",
            LockBackend::Redis(_) => "redis",
        };
        f.debug_struct("LockManager")
            .field("mode", &mode)
            .field("retry", &self.retry)
            .finish()
    }
}

impl LockManager {
    pub fn new_local(retry: RetryPolicy) -> Self {
        Self {
            backend: LockBackend::Local(Arc::new(DashMap::new())),
            retry,
        }
    }

    pub fn new_redis(pool: Pool, retry: RetryPolicy) -> Self {
        Self {
            backend: LockBackend::Redis(pool),
            retry,
        }
    }

    /// Acquire `key` for `ttl`, retrying on contention per the retry policy.
    ///
    /// # Errors
    ///
    /// `Busy` once every attempt found the lock held, `Unavailable` on the
    /// first backend failure.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lease, LockError> {
        let token = Uuid::new_v4().to_string();
        for attempt in 1..=self.retry.max_attempts {
            if self.try_acquire(key, &token, ttl).await? {
                debug!(key = %key, attempt, "lock acquired");
                return Ok(Lease {
                    key: key.to_string(),
                    token,
                    ttl,
                });
            }
            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.interval).await;
            }
        }
        Err(LockError::Busy {
            key: key.to_string(),
        })
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        match &self.backend {
            LockBackend::Local(leases) => {
                let lease = LocalLease {
                    token: token.to_string(),
                    expires_at: Instant::now() + ttl,
                };
                match leases.entry(key.to_string()) {
                    Entry::Occupied(mut held) => {
                        if held.get().expires_at > Instant::now() {
                            return Ok(false);
                        }
                        held.insert(lease);
                        Ok(true)
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(lease);
                        Ok(true)
                    }
                }
            }
            LockBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                let reply: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await?;
                Ok(reply.is_some())
            }
        }
    }

    /// Extend a held lease to `ttl` from now.
    pub async fn refresh(&self, lease: &Lease, ttl: Duration) -> Result<(), LockError> {
        let refreshed = match &self.backend {
            LockBackend::Local(leases) => match leases.get_mut(&lease.key) {
                Some(mut held) if held.token == lease.token && held.expires_at > Instant::now() => {
                    held.expires_at = Instant::now() + ttl;
                    true
                }
                _ => false,
            },
            LockBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                let updated: i64 = redis::Script::new(REFRESH_SCRIPT)
                    .key(&lease.key)
                    .arg(&lease.token)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut conn)
                    .await?;
                updated == 1
            }
        };
        if refreshed {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                key: lease.key.clone(),
            })
        }
    }

    /// Release a lease. Releasing an expired or foreign lease is a no-op.
    pub async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        match &self.backend {
            LockBackend::Local(leases) => {
                leases.remove_if(&lease.key, |_, held| held.token == lease.token);
                Ok(())
            }
            LockBackend::Redis(pool) => {
                let mut conn = pool.get().await?;
                let _deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
                    .key(&lease.key)
                    .arg(&lease.token)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(())
            }
        }
    }
}

/// Releases its lease when dropped, so every exit path gives the lock back.
///
/// Prefer [`LeaseGuard::release`]; the drop path has to spawn the release.
#[derive(Debug)]
pub struct LeaseGuard {
    locks: LockManager,
    lease: Lease,
    released: bool,
}

impl LeaseGuard {
    pub fn new(locks: LockManager, lease: Lease) -> Self {
        Self {
            locks,
            lease,
            released: false,
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub async fn refresh(&self) -> Result<(), LockError> {
        self.locks.refresh(&self.lease, self.lease.ttl).await
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.locks.release(&self.lease).await {
            warn!(key = %self.lease.key, error = %e, "failed to release lock");
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let locks = self.locks.clone();
        let lease = self.lease.clone();
        handle.spawn(async move {
            if let Err(e) = locks.release(&lease).await {
                warn!(key = %lease.key, error = %e, "failed to release dropped lock");
            }
        });
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(5),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let locks = LockManager::new_local(fast_retry(2));
        let lease = locks
            .acquire("order:id:1:lock", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(lease.key(), "order:id:1:lock");

        let err = locks
            .acquire("order:id:1:lock", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }));

        // Other keys are independent
        assert!(locks.acquire("order:id:2:lock", Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_allows_reacquire_and_is_idempotent() {
        let locks = LockManager::new_local(fast_retry(1));
        let lease = locks.acquire("k", Duration::from_secs(5)).await.unwrap();
        locks.release(&lease).await.unwrap();
        locks.release(&lease).await.unwrap();

        let second = locks.acquire("k", Duration::from_secs(5)).await.unwrap();
        assert_ne!(second.token(), lease.token());

        // A stale lease cannot release the new holder's lock
        locks.release(&lease).await.unwrap();
        assert!(locks.acquire("k", Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let locks = LockManager::new_local(fast_retry(1));
        let first = locks.acquire("k", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = locks.acquire("k", Duration::from_secs(5)).await.unwrap();
        let err = locks.refresh(&first, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, LockError::NotHeld { .. }));
        assert!(locks.refresh(&second, Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let locks = LockManager::new_local(RetryPolicy {
            interval: Duration::from_millis(20),
            max_attempts: 10,
        });
        let lease = locks.acquire("k", Duration::from_secs(5)).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("k", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        locks.release(&lease).await.unwrap();

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_lock() {
        let locks = LockManager::new_local(fast_retry(1));
        {
            let lease = locks.acquire("k", Duration::from_secs(5)).await.unwrap();
            let _guard = LeaseGuard::new(locks.clone(), lease);
        }
        // The release is spawned; give it a chance to run.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(locks.acquire("k", Duration::from_secs(5)).await.is_ok());
    }
}

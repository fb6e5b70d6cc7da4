//! Shared cache plumbing for the per-aggregate caches and repositories:
//! TTL jitter, JSON snapshots with self-healing reads, and lock-guarded
//! background repopulation.

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backend::{CacheBackend, CacheError};
use super::lock::{LeaseGuard, LockError, LockManager};
use super::writer::BackgroundWriter;
use crate::config::CacheConfig;

/// Base TTL plus uniform random jitter, so entries written together do not
/// expire together.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    base: Duration,
    jitter: Duration,
}

impl TtlPolicy {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// A TTL in `[base, base + jitter]`.
    pub fn next_ttl(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl From<&CacheConfig> for TtlPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self::new(config.base_ttl(), config.jitter())
    }
}

/// How a repopulation attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repopulation {
    Written,
    /// Someone else filled the entry while we waited for the lock.
    AlreadyCached,
    LockBusy,
    LockUnavailable,
    Cancelled,
    Failed,
}

/// Running totals of repopulation outcomes, shared by every clone of a layer.
#[derive(Debug, Default)]
pub struct RepopulationStats {
    written: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl RepopulationStats {
    /// Entries actually written to the cache.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Attempts that wrote nothing: already cached, lock not taken, or cancelled.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: Repopulation) {
        let counter = match outcome {
            Repopulation::Written => &self.written,
            Repopulation::Failed => &self.failed,
            Repopulation::AlreadyCached
            | Repopulation::LockBusy
            | Repopulation::LockUnavailable
            | Repopulation::Cancelled => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
}

/// Cache backend, locks and background writer bundled for the repositories.
#[derive(Debug, Clone)]
pub struct CacheLayer {
    backend: CacheBackend,
    locks: LockManager,
    writer: BackgroundWriter,
    ttl: TtlPolicy,
    lock_ttl: Duration,
    cancel: CancellationToken,
    stats: Arc<RepopulationStats>,
}

impl CacheLayer {
    pub fn new(
        backend: CacheBackend,
        locks: LockManager,
        writer: BackgroundWriter,
        config: &CacheConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            locks,
            writer,
            ttl: TtlPolicy::from(config),
            lock_ttl: config.repopulate_lock_ttl(),
            cancel,
            stats: Arc::new(RepopulationStats::default()),
        }
    }

    pub fn backend(&self) -> &CacheBackend {
        &self.backend
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn writer(&self) -> &BackgroundWriter {
        &self.writer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn next_ttl(&self) -> Duration {
        self.ttl.next_ttl()
    }

    pub fn stats(&self) -> &RepopulationStats {
        &self.stats
    }

    /// Read a JSON snapshot. Transport errors are logged and read as a miss;
    /// undecodable bytes are deleted and read as a miss.
    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.backend.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    data = %String::from_utf8_lossy(&bytes),
                    "corrupt cache entry, deleting"
                );
                self.delete_logged(key).await;
                None
            }
        }
    }

    /// Read `start..=stop` of a cached list with the same miss and
    /// self-healing rules as [`CacheLayer::read_json`]. One bad item drops
    /// the whole list.
    pub async fn read_list<T, D>(&self, key: &str, start: isize, stop: isize, decode: D) -> Option<Vec<T>>
    where
        D: Fn(&[u8]) -> Result<T, String>,
    {
        let items = match self.backend.list_range(key, start, stop).await {
            Ok(Some(items)) => items,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "cache list read failed, treating as miss");
                return None;
            }
        };
        let mut values = Vec::with_capacity(items.len());
        for item in &items {
            match decode(item) {
                Ok(value) => values.push(value),
                Err(e) => {
                    warn!(
                        key = %key,
                        error = %e,
                        bad_data = %String::from_utf8_lossy(item),
                        "corrupt cache list item, deleting list"
                    );
                    self.delete_logged(key).await;
                    return None;
                }
            }
        }
        Some(values)
    }

    pub async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let bytes = encode_json(value)?;
        self.backend.set(key, bytes, self.next_ttl()).await
    }

    /// Whether `key` currently holds a string entry. Errors count as absent.
    pub async fn contains(&self, key: &str) -> bool {
        matches!(self.backend.get(key).await, Ok(Some(_)))
    }

    /// Whether `key` currently holds a list. Errors count as absent.
    pub async fn contains_list(&self, key: &str) -> bool {
        matches!(self.backend.list_range(key, 0, 0).await, Ok(Some(_)))
    }

    pub async fn delete_logged(&self, key: &str) {
        if let Err(e) = self.backend.delete(key).await {
            warn!(key = %key, error = %e, "cache delete failed");
        }
    }

    /// Run `work` on the background writer without a lock.
    pub fn spawn<F>(&self, task: &'static str, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.writer.submit(task, work)
    }

    /// Submit a lock-guarded repopulation to the background writer.
    pub fn repopulate<C, W>(&self, task: &'static str, lock_key: String, is_cached: C, write: W) -> bool
    where
        C: Future<Output = bool> + Send + 'static,
        W: Future<Output = Result<(), CacheError>> + Send + 'static,
    {
        let layer = self.clone();
        self.writer.submit(task, async move {
            let outcome = layer.repopulate_now(&lock_key, is_cached, write).await;
            debug!(lock_key = %lock_key, outcome = ?outcome, "repopulation finished");
        })
    }

    /// Take the lock, skip if the entry appeared meanwhile, otherwise write
    /// while keeping the lease alive. The lease is released on every path.
    pub async fn repopulate_now<C, W>(&self, lock_key: &str, is_cached: C, write: W) -> Repopulation
    where
        C: Future<Output = bool>,
        W: Future<Output = Result<(), CacheError>>,
    {
        let outcome = self.repopulate_locked(lock_key, is_cached, write).await;
        self.stats.record(outcome);
        outcome
    }

    async fn repopulate_locked<C, W>(&self, lock_key: &str, is_cached: C, write: W) -> Repopulation
    where
        C: Future<Output = bool>,
        W: Future<Output = Result<(), CacheError>>,
    {
        let lease = match self.locks.acquire(lock_key, self.lock_ttl).await {
            Ok(lease) => lease,
            Err(LockError::Busy { .. }) => {
                debug!(lock_key = %lock_key, "repopulation lock busy, skipping");
                return Repopulation::LockBusy;
            }
            Err(e) => {
                warn!(lock_key = %lock_key, error = %e, "repopulation lock unavailable, skipping");
                return Repopulation::LockUnavailable;
            }
        };
        let guard = LeaseGuard::new(self.locks.clone(), lease);
        let outcome = self.write_under_lease(&guard, is_cached, write).await;
        guard.release().await;
        outcome
    }

    async fn write_under_lease<C, W>(&self, guard: &LeaseGuard, is_cached: C, write: W) -> Repopulation
    where
        C: Future<Output = bool>,
        W: Future<Output = Result<(), CacheError>>,
    {
        if is_cached.await {
            return Repopulation::AlreadyCached;
        }

        let period = (guard.lease().ttl() / 2).max(Duration::from_millis(1));
        let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(write);

        loop {
            tokio::select! {
                result = &mut write => {
                    return match result {
                        Ok(()) => Repopulation::Written,
                        Err(e) => {
                            warn!(lock_key = %guard.lease().key(), error = %e, "cache repopulation failed");
                            Repopulation::Failed
                        }
                    };
                }
                _ = refresh.tick() => {
                    if let Err(e) = guard.refresh().await {
                        warn!(lock_key = %guard.lease().key(), error = %e, "failed to refresh repopulation lease");
                    }
                }
                _ = self.cancel.cancelled() => {
                    debug!(lock_key = %guard.lease().key(), "repopulation cancelled");
                    return Repopulation::Cancelled;
                }
            }
        }
    }
}

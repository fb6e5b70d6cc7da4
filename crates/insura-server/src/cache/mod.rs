//! Cache-aside building blocks.
//!
//! ## Architecture
//!
//! - **Backend**: Redis (shared across instances) or an in-process map
//! - **Locks**: leases that serialize cache repopulation per key
//! - **Coalescer**: one store load per burst of identical in-process reads
//! - **Writer**: bounded, timed, detached background cache writes
//!
//! ## Read Path
//!
//! ```text
//! read → cache hit? ── yes → return
//!             │ no
//!             └→ coalesced store load → return
//!                       └→ background: lock → re-check → write (lease refreshed) → release
//! ```
//!
//! ## Graceful Degradation
//!
//! Cache and lock failures are logged and read as misses; the store stays
//! authoritative. Without Redis every component falls back to its local mode.

pub mod backend;
pub mod chat;
pub mod coalesce;
pub mod keys;
pub mod layer;
pub mod lock;
pub mod order;
pub mod product;
pub mod user;
pub mod writer;

pub use backend::{CacheBackend, CacheError, LocalCache};
pub use chat::ChatCache;
pub use coalesce::{Coalescer, LoadAborted};
pub use layer::{CacheLayer, Repopulation, RepopulationStats, TtlPolicy};
pub use lock::{Lease, LeaseGuard, LockError, LockManager, RetryPolicy};
pub use order::OrderCache;
pub use product::ProductCache;
pub use user::UserCache;
pub use writer::BackgroundWriter;

use std::time::Duration;

use crate::config::RedisConfig;

/// Connect a Redis pool, or `None` when Redis is disabled or unreachable.
///
/// Callers fall back to local backends on `None`, so the process starts
/// and runs without Redis.
pub async fn create_redis_pool(config: &RedisConfig) -> Option<deadpool_redis::Pool> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local backends");
        return None;
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    if let Some(ref mut pool_config) = redis_config.pool {
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = Some(Duration::from_millis(config.timeout_ms));
        pool_config.timeouts.create = Some(Duration::from_millis(config.timeout_ms));
        pool_config.timeouts.recycle = Some(Duration::from_millis(config.timeout_ms));
    } else {
        let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(Duration::from_millis(config.timeout_ms));
        pool_config.timeouts.create = Some(Duration::from_millis(config.timeout_ms));
        pool_config.timeouts.recycle = Some(Duration::from_millis(config.timeout_ms));
        redis_config.pool = Some(pool_config);
    }

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local backends."
            );
            return None;
        }
    };

    match pool.get().await {
        Ok(_) => {
            tracing::info!("Connected to Redis");
            Some(pool)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local backends."
            );
            None
        }
    }
}

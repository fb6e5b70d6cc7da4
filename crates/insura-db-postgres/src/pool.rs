//! Pool setup for the store. Connections are opened lazily beyond the first
//! one, so a small instance does not hold idle sessions it never uses.

use std::time::Duration;

use sqlx_core::pool::PoolOptions;
use sqlx_postgres::{PgPool, Postgres};
use tracing::{debug, info, instrument};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, Result};

pub type PgPoolOptions = PoolOptions<Postgres>;

/// Pool limits derived from the store configuration.
pub fn pool_options(config: &PostgresConfig) -> PgPoolOptions {
    let options = PgPoolOptions::new()
        .max_connections(config.pool_size.max(1))
        .min_connections(0)
        .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
        .test_before_acquire(false);
    match config.idle_timeout_ms {
        Some(ms) => options.idle_timeout(Duration::from_millis(ms)),
        None => options.idle_timeout(None),
    }
}

/// Open the pool and make sure the database answers.
#[instrument(skip(config), fields(target = %connection_target(&config.url)))]
pub async fn create_pool(config: &PostgresConfig) -> Result<PgPool> {
    info!(
        pool_size = config.pool_size,
        connect_timeout_ms = config.connect_timeout_ms,
        bootstrap_schema = config.bootstrap_schema,
        "opening store pool"
    );
    let pool = pool_options(config).connect(&config.url).await?;
    ping(&pool).await?;
    debug!("store pool ready");
    Ok(pool)
}

/// Round trip to the database.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx_core::query::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(PostgresError::from)?;
    Ok(())
}

/// `host[:port]/database` of a connection URL, without credentials or query.
fn connection_target(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    rest.split('?').next().unwrap_or(rest)
}

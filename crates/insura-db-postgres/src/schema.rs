//! Idempotent schema bootstrap.

use sqlx_core::query::query;
use sqlx_postgres::PgPool;
use tracing::{debug, info};

use crate::error::{PostgresError, Result};

/// DDL statements, applied one at a time (prepared statements cannot batch).
const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGINT PRIMARY KEY,
        username VARCHAR(32) NOT NULL UNIQUE,
        password_hash VARCHAR(128) NOT NULL,
        email VARCHAR(128) NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id BIGINT PRIMARY KEY,
        name VARCHAR(128) NOT NULL,
        category VARCHAR(32) NOT NULL,
        base_price_cents BIGINT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        features JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_products_category ON products (category)",
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id BIGINT PRIMARY KEY,
        user_id BIGINT NOT NULL,
        product_id BIGINT NOT NULL,
        product_name_snapshot VARCHAR(128) NOT NULL,
        unit_price_cents BIGINT NOT NULL,
        total_amount_cents BIGINT NOT NULL,
        status SMALLINT NOT NULL DEFAULT 0,
        policy_number VARCHAR(64),
        version BIGINT NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_orders_user ON orders (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS chat_messages (
        id BIGINT PRIMARY KEY,
        session_id VARCHAR(64) NOT NULL,
        user_id BIGINT NOT NULL,
        role VARCHAR(10) NOT NULL,
        content TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages (session_id, id)",
];

/// Creates every table and index that does not exist yet.
pub async fn bootstrap_schema(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        query(statement)
            .execute(pool)
            .await
            .map_err(|e| PostgresError::schema(format!("schema bootstrap failed: {e}")))?;
    }
    debug!(statements = STATEMENTS.len(), "schema statements applied");
    info!("PostgreSQL schema ready");
    Ok(())
}

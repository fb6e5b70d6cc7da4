//! `insura-storage` trait implementations over a PostgreSQL pool.

use async_trait::async_trait;
use insura_core::{ChatMessage, Order, OrderStatus, Product, User};
use insura_storage::{
    ChatStore, OrderStore, ProductQuery, ProductStore, StorageError, UserStore, category_filter,
};
use serde_json::Value;
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::{PgPool, PgRow};
use time::OffsetDateTime;
use tracing::instrument;

use crate::config::PostgresConfig;
use crate::error::{Result, is_unique_violation, map_sqlx_error};
use crate::pool::{create_pool, ping};
use crate::schema::bootstrap_schema;

const ORDER_COLUMNS: &str = "id, user_id, product_id, product_name_snapshot, unit_price_cents, \
     total_amount_cents, status, policy_number, version, created_at, updated_at";

const PRODUCT_COLUMNS: &str =
    "id, name, category, base_price_cents, description, features, created_at, updated_at";

/// PostgreSQL-backed source of truth.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects and, if configured, bootstraps the schema.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        if config.bootstrap_schema {
            bootstrap_schema(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Wraps an existing pool without touching the schema.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable (for health checks).
    pub async fn is_available(&self) -> bool {
        ping(&self.pool).await.is_ok()
    }

    async fn current_status(&self, id: i64) -> std::result::Result<Option<OrderStatus>, StorageError> {
        let row = query("SELECT status FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        match row {
            Some(row) => {
                let code: i16 = row.try_get("status").map_err(map_sqlx_error)?;
                Ok(Some(decode_status(code)?))
            }
            None => Ok(None),
        }
    }

    /// Compare-and-swap on `status`; the row only changes when it still holds `expected`.
    async fn transition(
        &self,
        id: i64,
        expected: OrderStatus,
        next: OrderStatus,
        policy_number: Option<&str>,
    ) -> std::result::Result<Order, StorageError> {
        if !expected.can_transition_to(next) {
            return Err(StorageError::invalid_transition("order", id, expected, next));
        }
        let sql = format!(
            "UPDATE orders SET status = $1, policy_number = COALESCE($2, policy_number), \
             version = version + 1, updated_at = $3 \
             WHERE id = $4 AND status = $5 RETURNING {ORDER_COLUMNS}"
        );
        let row = query(&sql)
            .bind(next.code())
            .bind(policy_number)
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .bind(expected.code())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => order_from_row(&row),
            None => match self.current_status(id).await? {
                Some(actual) => Err(StorageError::version_conflict("order", id, expected, actual)),
                None => Err(StorageError::not_found("order", id)),
            },
        }
    }
}

fn decode_status(code: i16) -> std::result::Result<OrderStatus, StorageError> {
    OrderStatus::from_code(code).map_err(|e| StorageError::invalid_record(e.to_string()))
}

fn user_from_row(row: &PgRow) -> std::result::Result<User, StorageError> {
    Ok(User {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        username: row.try_get("username").map_err(map_sqlx_error)?,
        password_hash: row.try_get("password_hash").map_err(map_sqlx_error)?,
        email: row.try_get("email").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
    })
}

fn product_from_row(row: &PgRow) -> std::result::Result<Product, StorageError> {
    let features = match row.try_get::<Value, _>("features").map_err(map_sqlx_error)? {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(StorageError::invalid_record(format!(
                "product features must be a JSON object, got {other}"
            )));
        }
    };
    Ok(Product {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        name: row.try_get("name").map_err(map_sqlx_error)?,
        category: row.try_get("category").map_err(map_sqlx_error)?,
        base_price_cents: row.try_get("base_price_cents").map_err(map_sqlx_error)?,
        description: row.try_get("description").map_err(map_sqlx_error)?,
        features,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
    })
}

fn order_from_row(row: &PgRow) -> std::result::Result<Order, StorageError> {
    let status: i16 = row.try_get("status").map_err(map_sqlx_error)?;
    Ok(Order {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        user_id: row.try_get("user_id").map_err(map_sqlx_error)?,
        product_id: row.try_get("product_id").map_err(map_sqlx_error)?,
        product_name_snapshot: row.try_get("product_name_snapshot").map_err(map_sqlx_error)?,
        unit_price_cents: row.try_get("unit_price_cents").map_err(map_sqlx_error)?,
        total_amount_cents: row.try_get("total_amount_cents").map_err(map_sqlx_error)?,
        status: decode_status(status)?,
        policy_number: row.try_get("policy_number").map_err(map_sqlx_error)?,
        version: row.try_get("version").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
    })
}

fn chat_from_row(row: &PgRow) -> std::result::Result<ChatMessage, StorageError> {
    let role: String = row.try_get("role").map_err(map_sqlx_error)?;
    Ok(ChatMessage {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        session_id: row.try_get("session_id").map_err(map_sqlx_error)?,
        user_id: row.try_get("user_id").map_err(map_sqlx_error)?,
        role: role
            .parse()
            .map_err(|e: insura_core::CoreError| StorageError::invalid_record(e.to_string()))?,
        content: row.try_get("content").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

/// Maps insert failures, turning unique violations into `AlreadyExists`.
fn insert_error(entity: &str, id: impl ToString, err: sqlx_core::error::Error) -> StorageError {
    if is_unique_violation(&err) {
        StorageError::already_exists(entity, id)
    } else {
        map_sqlx_error(err)
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> std::result::Result<Option<User>, StorageError> {
        let row = query(
            "SELECT id, username, password_hash, email, created_at, updated_at \
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(user_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_username(
        &self,
        username: &str,
    ) -> std::result::Result<Option<User>, StorageError> {
        let row = query(
            "SELECT id, username, password_hash, email, created_at, updated_at \
             FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn create(&self, user: &User) -> std::result::Result<(), StorageError> {
        query(
            "INSERT INTO users (id, username, password_hash, email, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.email)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("user", &user.username, e))?;
        Ok(())
    }
}

#[async_trait]
impl ProductStore for PostgresStore {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> std::result::Result<Option<Product>, StorageError> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1");
        let row = query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(product_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, params: &ProductQuery) -> std::result::Result<Vec<Product>, StorageError> {
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE ($1::TEXT IS NULL OR category = $1) \
             ORDER BY id DESC OFFSET $2 LIMIT $3"
        );
        let rows = query(&sql)
            .bind(params.category())
            .bind(params.offset as i64)
            .bind(params.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(product_from_row).collect()
    }

    async fn count(&self, category: Option<&str>) -> std::result::Result<u64, StorageError> {
        let row = query(
            "SELECT COUNT(*) AS total FROM products WHERE ($1::TEXT IS NULL OR category = $1)",
        )
        .bind(category_filter(category))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        let total: i64 = row.try_get("total").map_err(map_sqlx_error)?;
        Ok(total.max(0) as u64)
    }

    async fn create(&self, product: &Product) -> std::result::Result<(), StorageError> {
        query(
            "INSERT INTO products \
             (id, name, category, base_price_cents, description, features, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.category)
        .bind(product.base_price_cents)
        .bind(&product.description)
        .bind(Value::Object(product.features.clone()))
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("product", product.id, e))?;
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    #[instrument(skip(self))]
    async fn find_by_id(&self, id: i64) -> std::result::Result<Option<Order>, StorageError> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let row = query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(order_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_ids_by_user(&self, user_id: i64) -> std::result::Result<Vec<i64>, StorageError> {
        let rows = query("SELECT id FROM orders WHERE user_id = $1 ORDER BY id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(map_sqlx_error))
            .collect()
    }

    async fn create(&self, order: &Order) -> std::result::Result<(), StorageError> {
        query(
            "INSERT INTO orders \
             (id, user_id, product_id, product_name_snapshot, unit_price_cents, total_amount_cents, \
              status, policy_number, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(order.product_id)
        .bind(&order.product_name_snapshot)
        .bind(order.unit_price_cents)
        .bind(order.total_amount_cents)
        .bind(order.status.code())
        .bind(order.policy_number.as_deref())
        .bind(order.version)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("order", order.id, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        id: i64,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> std::result::Result<Order, StorageError> {
        self.transition(id, expected, next, None).await
    }

    #[instrument(skip(self))]
    async fn update_policy(
        &self,
        id: i64,
        policy_number: &str,
    ) -> std::result::Result<Order, StorageError> {
        self.transition(id, OrderStatus::Paid, OrderStatus::Active, Some(policy_number))
            .await
    }
}

#[async_trait]
impl ChatStore for PostgresStore {
    async fn create(&self, message: &ChatMessage) -> std::result::Result<(), StorageError> {
        query(
            "INSERT INTO chat_messages (id, session_id, user_id, role, content, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(message.id)
        .bind(&message.session_id)
        .bind(message.user_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("chat_message", message.id, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recent(
        &self,
        session_id: &str,
        limit: usize,
    ) -> std::result::Result<Vec<ChatMessage>, StorageError> {
        let rows = query(
            "SELECT id, session_id, user_id, role, content, created_at FROM chat_messages \
             WHERE session_id = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        // Fetched newest first for the LIMIT; hand back in chronological order.
        let mut messages = rows
            .iter()
            .map(chat_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}

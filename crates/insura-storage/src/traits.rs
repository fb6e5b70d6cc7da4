//! Store traits for the relational source of truth.
//!
//! Every implementation must be thread-safe (`Send + Sync`) and must report a
//! missing record on lookups as `Ok(None)`, never as an error.

use async_trait::async_trait;
use insura_core::{ChatMessage, Order, OrderStatus, Product, User};

use crate::error::StorageError;
use crate::types::ProductQuery;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StorageError>;

    /// Looks a user up by the unique `username` column.
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// Inserts a user.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the id or username is taken.
    async fn create(&self, user: &User) -> Result<(), StorageError>;
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Product>, StorageError>;

    /// Returns one page of products, newest first.
    async fn list(&self, query: &ProductQuery) -> Result<Vec<Product>, StorageError>;

    /// Counts products matching the query's category filter.
    async fn count(&self, category: Option<&str>) -> Result<u64, StorageError>;

    async fn create(&self, product: &Product) -> Result<(), StorageError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Order>, StorageError>;

    /// Returns the ids of all orders placed by `user_id`, oldest first.
    async fn find_ids_by_user(&self, user_id: i64) -> Result<Vec<i64>, StorageError>;

    async fn create(&self, order: &Order) -> Result<(), StorageError>;

    /// Moves an order from `expected` to `next` and bumps its version.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the order does not exist.
    /// Returns `StorageError::InvalidTransition` if `expected -> next` is illegal.
    /// Returns `StorageError::VersionConflict` if the stored status is not `expected`.
    async fn update_status(
        &self,
        id: i64,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Order, StorageError>;

    /// Records the issued policy and moves the order from `Paid` to `Active`.
    ///
    /// Same error contract as [`OrderStore::update_status`].
    async fn update_policy(&self, id: i64, policy_number: &str) -> Result<Order, StorageError>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create(&self, message: &ChatMessage) -> Result<(), StorageError>;

    /// Returns the last `limit` messages of a session in chronological order.
    async fn recent(&self, session_id: &str, limit: usize)
    -> Result<Vec<ChatMessage>, StorageError>;
}

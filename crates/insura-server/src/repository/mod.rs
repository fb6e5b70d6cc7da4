//! Cache-aside repositories, one per aggregate.
//!
//! Reads check the cache, fall back to a coalesced store load, and hand the
//! result to a lock-guarded background repopulation. Writes go to the store
//! first; derived caches are patched or dropped in the background.
//! Cache failures never reach callers: the worst case is a slower read.

mod chat;
mod order;
mod product;
mod user;

pub use chat::ChatRepository;
pub use order::OrderRepository;
pub use product::ProductRepository;
pub use user::UserRepository;

use insura_storage::{ErrorCategory, StorageError, Stores};
use std::sync::Arc;

use crate::cache::{CacheLayer, LoadAborted};

/// Errors returned by repositories.
///
/// "Not found" on lookups is `Ok(None)`, not an error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] StorageError),

    #[error(transparent)]
    Aborted(#[from] LoadAborted),
}

impl RepositoryError {
    pub fn storage(&self) -> Option<&StorageError> {
        match self {
            RepositoryError::Store(e) => Some(e),
            RepositoryError::Aborted(_) => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RepositoryError::Store(e) => e.category(),
            RepositoryError::Aborted(_) => ErrorCategory::Internal,
        }
    }

    /// Business outcome (not found, conflict, validation) rather than infrastructure failure.
    pub fn is_business(&self) -> bool {
        self.storage().is_some_and(StorageError::is_business)
    }

    pub fn is_version_conflict(&self) -> bool {
        self.storage().is_some_and(StorageError::is_version_conflict)
    }

    pub fn is_already_exists(&self) -> bool {
        self.storage().is_some_and(StorageError::is_already_exists)
    }

    pub fn is_not_found(&self) -> bool {
        self.storage().is_some_and(StorageError::is_not_found)
    }
}

/// Every repository, built once at startup.
#[derive(Debug, Clone)]
pub struct Repositories {
    pub users: Arc<UserRepository>,
    pub products: Arc<ProductRepository>,
    pub orders: Arc<OrderRepository>,
    pub chats: Arc<ChatRepository>,
}

impl Repositories {
    pub fn new(stores: Stores, layer: CacheLayer) -> Self {
        Self {
            users: Arc::new(UserRepository::new(stores.users, layer.clone())),
            products: Arc::new(ProductRepository::new(stores.products, layer.clone())),
            orders: Arc::new(OrderRepository::new(stores.orders, layer.clone())),
            chats: Arc::new(ChatRepository::new(stores.chats, layer)),
        }
    }
}

//! # insura-storage
//!
//! Relational store abstraction for the insura backend.
//!
//! This crate defines the traits that every source-of-truth backend must
//! implement. It contains no implementations; see `insura-db-memory` and
//! `insura-db-postgres`.
//!
//! ## Example
//!
//! ```ignore
//! use insura_storage::{OrderStore, StorageError};
//!
//! async fn order_exists(store: &dyn OrderStore, id: i64) -> Result<bool, StorageError> {
//!     Ok(store.find_by_id(id).await?.is_some())
//! }
//! ```

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::{ChatStore, OrderStore, ProductStore, UserStore};
pub use types::{Page, ProductQuery, category_filter};

use std::sync::Arc;

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

pub type DynUserStore = Arc<dyn UserStore>;
pub type DynProductStore = Arc<dyn ProductStore>;
pub type DynOrderStore = Arc<dyn OrderStore>;
pub type DynChatStore = Arc<dyn ChatStore>;

/// The full set of stores, built once at startup and handed to the repositories.
#[derive(Clone)]
pub struct Stores {
    pub users: DynUserStore,
    pub products: DynProductStore,
    pub orders: DynOrderStore,
    pub chats: DynChatStore,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

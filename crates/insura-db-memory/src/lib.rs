//! # insura-db-memory
//!
//! In-memory implementation of the `insura-storage` traits.
//!
//! Used for single-process deployments, local development and tests. All maps
//! are `DashMap`s so concurrent readers never block each other; status
//! compare-and-swap holds the shard lock of the order being updated.

mod storage;

pub use storage::InMemoryStore;

use std::sync::Arc;

use insura_storage::Stores;

/// Builds a [`Stores`] bundle backed by a single shared [`InMemoryStore`].
pub fn create_stores() -> Stores {
    InMemoryStore::new().into_stores()
}

impl InMemoryStore {
    /// Wraps this store into the trait-object bundle the repositories consume.
    pub fn into_stores(self) -> Stores {
        let store = Arc::new(self);
        Stores {
            users: store.clone(),
            products: store.clone(),
            orders: store.clone(),
            chats: store,
        }
    }
}

use insura_core::User;
use insura_storage::DynUserStore;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::RepositoryError;
use crate::cache::{CacheLayer, Coalescer, UserCache, keys};

pub struct UserRepository {
    store: DynUserStore,
    cache: UserCache,
    layer: CacheLayer,
    loads: Coalescer<Option<User>, RepositoryError>,
}

impl std::fmt::Debug for UserRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRepository")
            .field("loads", &self.loads)
            .finish_non_exhaustive()
    }
}

impl UserRepository {
    pub fn new(store: DynUserStore, layer: CacheLayer) -> Self {
        Self {
            store,
            cache: UserCache::new(layer.clone()),
            layer,
            loads: Coalescer::new(),
        }
    }

    pub fn cache(&self) -> &UserCache {
        &self.cache
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>, RepositoryError> {
        if let Some(user) = self.cache.get_by_id(id).await {
            return Ok(Some(user));
        }
        debug!(user_id = id, "user cache miss");
        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let layer = self.layer.clone();
        self.loads
            .run(&format!("user:find_by_id:{id}"), move || async move {
                let user = store.find_by_id(id).await?;
                if let Some(user) = &user {
                    repopulate(&layer, &cache, user, keys::user_by_id(id));
                }
                Ok(user)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError> {
        if let Some(user) = self.cache.get_by_name(username).await {
            return Ok(Some(user));
        }
        debug!(username, "user cache miss");
        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let layer = self.layer.clone();
        let name = username.to_string();
        self.loads
            .run(&format!("user:find_by_username:{username}"), move || async move {
                let user = store.find_by_username(&name).await?;
                if let Some(user) = &user {
                    repopulate(&layer, &cache, user, keys::user_by_username(&name));
                }
                Ok(user)
            })
            .await
    }

    /// Register a user. Duplicate usernames surface as `AlreadyExists`.
    pub async fn create(&self, user: &User) -> Result<(), RepositoryError> {
        self.store.create(user).await?;
        Ok(())
    }
}

/// Both user keys are written together under the id lock; `probe` is the
/// key whose miss triggered the load.
fn repopulate(layer: &CacheLayer, cache: &UserCache, user: &User, probe: String) {
    let check = layer.clone();
    let writer = cache.clone();
    let user = user.clone();
    layer.repopulate(
        "user_repopulate",
        keys::lock_for(&keys::user_by_id(user.id)),
        async move { check.contains(&probe).await },
        async move { writer.set(&user).await },
    );
}

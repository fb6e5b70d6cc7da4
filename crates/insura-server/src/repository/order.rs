use insura_core::{Order, OrderStatus};
use insura_storage::DynOrderStore;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::RepositoryError;
use crate::cache::{CacheLayer, Coalescer, OrderCache, keys};

pub struct OrderRepository {
    store: DynOrderStore,
    cache: OrderCache,
    layer: CacheLayer,
    loads: Coalescer<Option<Order>, RepositoryError>,
    id_lists: Coalescer<Vec<i64>, RepositoryError>,
    creates: Coalescer<Order, RepositoryError>,
}

impl std::fmt::Debug for OrderRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderRepository")
            .field("loads", &self.loads)
            .field("id_lists", &self.id_lists)
            .field("creates", &self.creates)
            .finish_non_exhaustive()
    }
}

impl OrderRepository {
    pub fn new(store: DynOrderStore, layer: CacheLayer) -> Self {
        Self {
            store,
            cache: OrderCache::new(layer.clone()),
            layer,
            loads: Coalescer::new(),
            id_lists: Coalescer::new(),
            creates: Coalescer::new(),
        }
    }

    pub fn cache(&self) -> &OrderCache {
        &self.cache
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: i64) -> Result<Option<Order>, RepositoryError> {
        if let Some(order) = self.cache.get_by_id(id).await {
            return Ok(Some(order));
        }
        debug!(order_id = id, "order cache miss");
        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let layer = self.layer.clone();
        self.loads
            .run(&format!("order:find_by_id:{id}"), move || async move {
                let order = store.find_by_id(id).await?;
                if let Some(order) = &order {
                    let key = keys::order_by_id(id);
                    let check = layer.clone();
                    let order = order.clone();
                    layer.repopulate(
                        "order_repopulate",
                        keys::lock_for(&key),
                        async move { check.contains(&key).await },
                        async move { cache.set(&order).await },
                    );
                }
                Ok(order)
            })
            .await
    }

    /// Ids of every order placed by `user_id`, oldest first.
    #[instrument(skip(self))]
    pub async fn find_user_order_ids(&self, user_id: i64) -> Result<Vec<i64>, RepositoryError> {
        if let Some(ids) = self.cache.get_user_order_ids(user_id).await {
            return Ok(ids);
        }
        debug!(user_id, "user order list cache miss");
        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let layer = self.layer.clone();
        self.id_lists
            .run(&format!("order:find_user_order_ids:{user_id}"), move || async move {
                let ids = store.find_ids_by_user(user_id).await?;
                if !ids.is_empty() {
                    let key = keys::orders_of_user(user_id);
                    let check = layer.clone();
                    let snapshot = ids.clone();
                    layer.repopulate(
                        "order_list_repopulate",
                        keys::lock_for(&key),
                        async move { check.contains_list(&key).await },
                        async move { cache.replace_user_order_ids(user_id, &snapshot).await },
                    );
                }
                Ok(ids)
            })
            .await
    }

    /// Persist a new order.
    ///
    /// Identical concurrent submits (same user, product and status) share a
    /// single insert and all receive the same order. The user's cached id
    /// list is extended in the background, or dropped if that fails.
    #[instrument(skip(self, order), fields(order_id = order.id, user_id = order.user_id))]
    pub async fn create(&self, order: Order) -> Result<Order, RepositoryError> {
        let key = format!(
            "order:create:{}:{}:{}",
            order.user_id, order.product_id, order.status
        );
        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let layer = self.layer.clone();
        self.creates
            .run(&key, move || async move {
                store.create(&order).await?;
                let (user_id, order_id) = (order.user_id, order.id);
                layer.spawn("order_list_append", async move {
                    if let Err(e) = cache.append_user_order_id(user_id, order_id).await {
                        warn!(user_id, order_id, error = %e, "order list append failed, dropping list");
                        if let Err(e) = cache.delete_user_orders(user_id).await {
                            warn!(user_id, error = %e, "failed to drop user order list");
                        }
                    }
                });
                Ok(order)
            })
            .await
    }

    /// Compare-and-swap the order status. See [`insura_storage::OrderStore::update_status`].
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        id: i64,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Order, RepositoryError> {
        let order = self.store.update_status(id, expected, next).await?;
        self.invalidate(id);
        Ok(order)
    }

    /// Record the issued policy; `Paid -> Active`.
    #[instrument(skip(self))]
    pub async fn update_policy(&self, id: i64, policy_number: &str) -> Result<Order, RepositoryError> {
        let order = self.store.update_policy(id, policy_number).await?;
        self.invalidate(id);
        Ok(order)
    }

    fn invalidate(&self, id: i64) {
        let cache = self.cache.clone();
        self.layer.spawn("order_invalidate", async move {
            if let Err(e) = cache.delete(id).await {
                warn!(order_id = id, error = %e, "order cache invalidation failed");
            }
        });
    }
}

use insura_core::Order;

use super::backend::CacheError;
use super::keys;
use super::layer::CacheLayer;

/// Order snapshots plus each user's order-id list.
///
/// Ids in the list are stored as decimal strings.
#[derive(Debug, Clone)]
pub struct OrderCache {
    layer: CacheLayer,
}

fn decode_id(bytes: &[u8]) -> Result<i64, String> {
    std::str::from_utf8(bytes)
        .map_err(|e| e.to_string())?
        .parse()
        .map_err(|e: std::num::ParseIntError| e.to_string())
}

impl OrderCache {
    pub fn new(layer: CacheLayer) -> Self {
        Self { layer }
    }

    pub async fn get_by_id(&self, id: i64) -> Option<Order> {
        self.layer.read_json(&keys::order_by_id(id)).await
    }

    pub async fn set(&self, order: &Order) -> Result<(), CacheError> {
        self.layer.write_json(&keys::order_by_id(order.id), order).await
    }

    pub async fn delete(&self, id: i64) -> Result<(), CacheError> {
        self.layer.backend().delete(&keys::order_by_id(id)).await
    }

    pub async fn get_user_order_ids(&self, user_id: i64) -> Option<Vec<i64>> {
        self.layer
            .read_list(&keys::orders_of_user(user_id), 0, -1, decode_id)
            .await
    }

    /// Append to the user's list if it is cached. Returns whether it was.
    pub async fn append_user_order_id(&self, user_id: i64, order_id: i64) -> Result<bool, CacheError> {
        self.layer
            .backend()
            .list_append_if_exists(&keys::orders_of_user(user_id), order_id.to_string().into_bytes())
            .await
    }

    /// Replace the user's list. An empty list removes the key.
    pub async fn replace_user_order_ids(&self, user_id: i64, ids: &[i64]) -> Result<(), CacheError> {
        let values = ids.iter().map(|id| id.to_string().into_bytes()).collect();
        self.layer
            .backend()
            .list_replace(&keys::orders_of_user(user_id), values, self.layer.next_ttl())
            .await
    }

    pub async fn delete_user_orders(&self, user_id: i64) -> Result<(), CacheError> {
        self.layer.backend().delete(&keys::orders_of_user(user_id)).await
    }
}

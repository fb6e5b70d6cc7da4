use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use insura_core::{ChatMessage, Order, OrderStatus, Product, User};
use insura_storage::{
    ChatStore, OrderStore, ProductQuery, ProductStore, StorageError, UserStore, category_filter,
};
use time::OffsetDateTime;

/// In-memory source of truth for users, products, orders and chat transcripts.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    users: DashMap<i64, User>,
    /// Unique index: username -> user id
    usernames: DashMap<String, i64>,
    products: DashMap<i64, Product>,
    orders: DashMap<i64, Order>,
    chats: DashMap<String, Vec<ChatMessage>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared compare-and-swap used by both status mutations.
    fn transition(
        &self,
        id: i64,
        expected: OrderStatus,
        next: OrderStatus,
        policy_number: Option<&str>,
    ) -> Result<Order, StorageError> {
        if !expected.can_transition_to(next) {
            return Err(StorageError::invalid_transition("order", id, expected, next));
        }
        let mut order = self
            .orders
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("order", id))?;
        if order.status != expected {
            return Err(StorageError::version_conflict(
                "order",
                id,
                expected,
                order.status,
            ));
        }
        order.status = next;
        if let Some(policy) = policy_number {
            order.policy_number = Some(policy.to_string());
        }
        order.version += 1;
        order.updated_at = OffsetDateTime::now_utc();
        tracing::debug!(order_id = id, from = %expected, to = %next, "order status updated");
        Ok(order.clone())
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StorageError> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        let Some(id) = self.usernames.get(username).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn create(&self, user: &User) -> Result<(), StorageError> {
        if self.users.contains_key(&user.id) {
            return Err(StorageError::already_exists("user", user.id));
        }
        match self.usernames.entry(user.username.clone()) {
            Entry::Occupied(_) => Err(StorageError::already_exists("user", &user.username)),
            Entry::Vacant(slot) => {
                self.users.insert(user.id, user.clone());
                slot.insert(user.id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProductStore for InMemoryStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Product>, StorageError> {
        Ok(self.products.get(&id).map(|p| p.clone()))
    }

    async fn list(&self, query: &ProductQuery) -> Result<Vec<Product>, StorageError> {
        let mut matching: Vec<Product> = self
            .products
            .iter()
            .filter(|p| query.category().is_none_or(|c| p.category == c))
            .map(|p| p.clone())
            .collect();
        // Newest first; snowflake ids are time-ordered.
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn count(&self, category: Option<&str>) -> Result<u64, StorageError> {
        let category = category_filter(category);
        let count = self
            .products
            .iter()
            .filter(|p| category.is_none_or(|c| p.category == c))
            .count();
        Ok(count as u64)
    }

    async fn create(&self, product: &Product) -> Result<(), StorageError> {
        match self.products.entry(product.id) {
            Entry::Occupied(_) => Err(StorageError::already_exists("product", product.id)),
            Entry::Vacant(slot) => {
                slot.insert(product.clone());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Order>, StorageError> {
        Ok(self.orders.get(&id).map(|o| o.clone()))
    }

    async fn find_ids_by_user(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        let mut ids: Vec<i64> = self
            .orders
            .iter()
            .filter(|o| o.user_id == user_id)
            .map(|o| o.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn create(&self, order: &Order) -> Result<(), StorageError> {
        match self.orders.entry(order.id) {
            Entry::Occupied(_) => Err(StorageError::already_exists("order", order.id)),
            Entry::Vacant(slot) => {
                slot.insert(order.clone());
                Ok(())
            }
        }
    }

    async fn update_status(
        &self,
        id: i64,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Order, StorageError> {
        self.transition(id, expected, next, None)
    }

    async fn update_policy(&self, id: i64, policy_number: &str) -> Result<Order, StorageError> {
        self.transition(id, OrderStatus::Paid, OrderStatus::Active, Some(policy_number))
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn create(&self, message: &ChatMessage) -> Result<(), StorageError> {
        self.chats
            .entry(message.session_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn recent(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let Some(messages) = self.chats.get(session_id) else {
            return Ok(Vec::new());
        };
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }
}

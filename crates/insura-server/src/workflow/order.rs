//! Order placement, payment and asynchronous underwriting.
//!
//! Payment is synchronous and authoritative: once the `Pending -> Paid`
//! compare-and-swap succeeds the payment stands, even if queueing the
//! underwriting task fails. Underwriting then runs off the order stream and
//! moves the order `Paid -> Active` with a freshly issued policy number.

use async_trait::async_trait;
use insura_core::{IdGenerator, Order, OrderStatus};
use insura_storage::StorageError;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::queue::{Handler, HandlerError, StreamQueue, UnderwritingTask};
use crate::repository::{OrderRepository, ProductRepository, RepositoryError};

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("product {0} not found")]
    ProductNotFound(i64),

    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("order {order_id} does not belong to user {user_id}")]
    Unauthorized { order_id: i64, user_id: i64 },

    #[error("order {order_id} cannot be paid in status {status}")]
    CannotPay { order_id: i64, status: OrderStatus },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl OrderError {
    /// Business outcome the caller can act on, as opposed to an infrastructure failure.
    pub fn is_business(&self) -> bool {
        match self {
            OrderError::Repository(e) => e.is_business(),
            _ => true,
        }
    }
}

/// `POL-<8 hex>-<order id>`.
pub fn policy_number(order_id: i64) -> String {
    let mut tag = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut tag);
    format!("POL-{}-{order_id}", hex::encode(tag))
}

pub struct OrderWorkflow {
    orders: Arc<OrderRepository>,
    products: Arc<ProductRepository>,
    queue: StreamQueue,
    ids: Arc<IdGenerator>,
    stream: String,
}

impl std::fmt::Debug for OrderWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderWorkflow")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl OrderWorkflow {
    pub fn new(
        orders: Arc<OrderRepository>,
        products: Arc<ProductRepository>,
        queue: StreamQueue,
        ids: Arc<IdGenerator>,
        stream: impl Into<String>,
    ) -> Self {
        Self {
            orders,
            products,
            queue,
            ids,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Place a pending order, snapshotting the product's current name and price.
    #[instrument(skip(self))]
    pub async fn create_order(&self, user_id: i64, product_id: i64) -> Result<Order, OrderError> {
        let product = self
            .products
            .find_by_id(product_id)
            .await?
            .ok_or(OrderError::ProductNotFound(product_id))?;
        let order = self
            .orders
            .create(Order::pending(self.ids.next_id(), user_id, &product))
            .await?;
        info!(order_id = order.id, user_id, product_id, "order created");
        Ok(order)
    }

    /// Pay a pending order and queue its underwriting.
    ///
    /// A concurrent second payment loses the compare-and-swap and gets
    /// `CannotPay`. A queue failure is logged and does not fail the payment.
    #[instrument(skip(self))]
    pub async fn pay_order(&self, user_id: i64, order_id: i64) -> Result<Order, OrderError> {
        let order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or(OrderError::OrderNotFound(order_id))?;
        if order.user_id != user_id {
            return Err(OrderError::Unauthorized { order_id, user_id });
        }
        if !order.can_pay() {
            return Err(OrderError::CannotPay {
                order_id,
                status: order.status,
            });
        }

        let paid = match self
            .orders
            .update_status(order_id, OrderStatus::Pending, OrderStatus::Paid)
            .await
        {
            Ok(paid) => paid,
            Err(RepositoryError::Store(StorageError::VersionConflict { actual, .. })) => {
                return Err(OrderError::CannotPay {
                    order_id,
                    status: actual.parse().unwrap_or(OrderStatus::Paid),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let task = UnderwritingTask {
            order_id: paid.id,
            user_id: paid.user_id,
            product_id: paid.product_id,
        };
        if let Err(e) = self.queue.push(&self.stream, &task).await {
            error!(
                order_id,
                user_id,
                product_id = paid.product_id,
                error = %e,
                "order paid but failed to queue underwriting task"
            );
        }
        Ok(paid)
    }
}

/// Issues policies for paid orders.
pub struct UnderwritingHandler {
    orders: Arc<OrderRepository>,
    delay: Duration,
}

impl UnderwritingHandler {
    pub fn new(orders: Arc<OrderRepository>, delay: Duration) -> Self {
        Self { orders, delay }
    }
}

#[async_trait]
impl Handler<UnderwritingTask> for UnderwritingHandler {
    async fn handle(&self, task: UnderwritingTask) -> Result<(), HandlerError> {
        info!(order_id = task.order_id, "start underwriting");
        // Stand-in for the external underwriting call.
        tokio::time::sleep(self.delay).await;

        let number = policy_number(task.order_id);
        match self.orders.update_policy(task.order_id, &number).await {
            Ok(order) => {
                info!(order_id = order.id, policy_number = %number, "underwriting completed, policy issued");
                Ok(())
            }
            // A redelivery after a lost ack finds the order already active.
            Err(RepositoryError::Store(StorageError::VersionConflict { actual, .. }))
                if actual == OrderStatus::Active.as_str() =>
            {
                warn!(order_id = task.order_id, "order already underwritten, skipping");
                Ok(())
            }
            Err(e) => {
                error!(order_id = task.order_id, error = %e, "failed to update policy number");
                Err(HandlerError::new(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::layer::tests::test_layer;
    use crate::config::QueueConfig;
    use crate::queue::{StreamBroker, StreamTask, group_name};
    use insura_core::Product;
    use insura_db_memory::InMemoryStore;
    use insura_storage::Stores;

    use crate::repository::Repositories;

    const STREAM: &str = "order_queue";

    async fn fixture() -> (OrderWorkflow, Repositories, StreamQueue) {
        let stores: Stores = InMemoryStore::new().into_stores();
        let repos = Repositories::new(stores, test_layer());
        repos
            .products
            .create(&Product::new(3, "travel basic", "travel", 4_900))
            .await
            .unwrap();
        let queue = StreamQueue::new(StreamBroker::new_local(), QueueConfig::default());
        let workflow = OrderWorkflow::new(
            Arc::clone(&repos.orders),
            Arc::clone(&repos.products),
            queue.clone(),
            Arc::new(IdGenerator::new(1).unwrap()),
            STREAM,
        );
        (workflow, repos, queue)
    }

    #[test]
    fn test_policy_number_format() {
        let number = policy_number(42);
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "POL");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[1].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts[2], "42");
    }

    #[tokio::test]
    async fn test_create_snapshots_product() {
        let (workflow, _, _) = fixture().await;
        let order = workflow.create_order(7, 3).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.product_name_snapshot, "travel basic");
        assert_eq!(order.total_amount_cents, 4_900);

        let err = workflow.create_order(7, 99).await.unwrap_err();
        assert!(matches!(err, OrderError::ProductNotFound(99)));
        assert!(err.is_business());
    }

    #[tokio::test]
    async fn test_pay_queues_underwriting_once() {
        let (workflow, _, queue) = fixture().await;
        let order = workflow.create_order(7, 3).await.unwrap();

        let err = workflow.pay_order(8, order.id).await.unwrap_err();
        assert!(matches!(err, OrderError::Unauthorized { .. }));

        let paid = workflow.pay_order(7, order.id).await.unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        assert_eq!(queue.broker().len(STREAM).await.unwrap(), 1);

        let err = workflow.pay_order(7, order.id).await.unwrap_err();
        assert!(matches!(err, OrderError::CannotPay { .. }));
        assert_eq!(queue.broker().len(STREAM).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_underwriting_activates_order_and_is_idempotent() {
        let (workflow, repos, queue) = fixture().await;
        let order = workflow.create_order(7, 3).await.unwrap();
        workflow.pay_order(7, order.id).await.unwrap();

        let handler = UnderwritingHandler::new(Arc::clone(&repos.orders), Duration::ZERO);
        let messages = queue
            .broker()
            .read_group(STREAM, &group_name(STREAM), "worker", 1, Duration::ZERO)
            .await
            .unwrap();
        let task = UnderwritingTask::decode(&messages[0].fields).unwrap();
        handler.handle(task).await.unwrap();

        // The store now reports the order as active.
        let err = repos
            .orders
            .update_status(order.id, OrderStatus::Paid, OrderStatus::Failed)
            .await
            .unwrap_err();
        match err {
            RepositoryError::Store(StorageError::VersionConflict { actual, .. }) => {
                assert_eq!(actual, "active")
            }
            other => panic!("unexpected error: {other}"),
        }

        // Redelivery of the same task is a no-op success.
        handler.handle(task).await.unwrap();
    }
}

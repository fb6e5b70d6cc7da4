//! Builds every component once from configuration and wires them together.
//!
//! Nothing here is global: the [`App`] owns the components and hands out
//! `Arc`s. One root [`CancellationToken`] stops every long-running loop.

use insura_core::{IdError, IdGenerator};
use insura_db_postgres::{PostgresError, PostgresStore};
use insura_storage::Stores;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{self, BackgroundWriter, CacheBackend, CacheLayer, LockManager, RetryPolicy};
use crate::config::{AppConfig, StorageBackend};
use crate::queue::{StreamBroker, StreamQueue, UnderwritingTask};
use crate::repository::Repositories;
use crate::workflow::{OrderWorkflow, UnderwritingHandler};

/// How long shutdown waits for the consumer loops to notice cancellation.
const CONSUMER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error("failed to open PostgreSQL store: {0}")]
    Postgres(#[from] PostgresError),
}

/// The assembled application.
pub struct App {
    config: AppConfig,
    ids: Arc<IdGenerator>,
    layer: CacheLayer,
    repositories: Repositories,
    queue: StreamQueue,
    orders: Arc<OrderWorkflow>,
    underwriting: Arc<UnderwritingHandler>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("instance", &self.config.server.instance_name)
            .field("cache", self.layer.backend())
            .field("broker", self.queue.broker())
            .finish_non_exhaustive()
    }
}

impl App {
    /// Open the configured store, connect Redis if enabled, and build everything.
    pub async fn build(config: AppConfig) -> Result<Self, BootstrapError> {
        config.validate().map_err(BootstrapError::Config)?;

        let stores = match config.storage.backend {
            StorageBackend::Memory => {
                info!("using in-memory store");
                insura_db_memory::create_stores()
            }
            StorageBackend::Postgres => {
                info!("using PostgreSQL store");
                PostgresStore::connect(&config.storage.postgres.to_pool_config())
                    .await?
                    .into_stores()
            }
        };
        let redis = cache::create_redis_pool(&config.redis).await;
        Self::assemble(config, stores, redis)
    }

    /// Build from already opened stores. `redis: None` selects the local
    /// cache, lock and broker backends.
    pub fn assemble(
        config: AppConfig,
        stores: Stores,
        redis: Option<deadpool_redis::Pool>,
    ) -> Result<Self, BootstrapError> {
        let ids = Arc::new(IdGenerator::new(config.server.node_id)?);
        let retry = RetryPolicy::from(&config.lock);
        let (backend, locks, broker) = match redis {
            Some(pool) => (
                CacheBackend::new_redis(pool.clone()),
                LockManager::new_redis(pool.clone(), retry),
                StreamBroker::new_redis(pool),
            ),
            None => (
                CacheBackend::new_local(),
                LockManager::new_local(retry),
                StreamBroker::new_local(),
            ),
        };

        let cancel = CancellationToken::new();
        let writer = BackgroundWriter::new(
            config.cache.max_inflight_writes,
            config.cache.write_timeout(),
        );
        let layer = CacheLayer::new(backend, locks, writer, &config.cache, cancel.child_token());
        let repositories = Repositories::new(stores, layer.clone());
        let queue = StreamQueue::new(broker, config.queue.clone());

        let orders = Arc::new(OrderWorkflow::new(
            Arc::clone(&repositories.orders),
            Arc::clone(&repositories.products),
            queue.clone(),
            Arc::clone(&ids),
            config.workflow.order_stream.clone(),
        ));
        let underwriting = Arc::new(UnderwritingHandler::new(
            Arc::clone(&repositories.orders),
            config.workflow.underwriting_delay(),
        ));

        info!(
            instance = %config.server.instance_name,
            node_id = config.server.node_id,
            cache = layer.backend().mode(),
            broker = queue.broker().mode(),
            "components assembled"
        );

        Ok(Self {
            config,
            ids,
            layer,
            repositories,
            queue,
            orders,
            underwriting,
            cancel,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.layer
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    pub fn queue(&self) -> &StreamQueue {
        &self.queue
    }

    pub fn orders(&self) -> &Arc<OrderWorkflow> {
        &self.orders
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Start the underwriting consumer. The instance name is the consumer name.
    pub fn spawn_underwriting_consumer(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let handler = Arc::clone(&self.underwriting);
        let cancel = self.cancel.child_token();
        let stream = self.config.workflow.order_stream.clone();
        let consumer = self.config.server.instance_name.clone();
        tokio::spawn(async move {
            queue
                .consume::<UnderwritingTask, _>(&stream, &consumer, handler, cancel)
                .await;
        })
    }

    /// Run the consumer until `shutdown` resolves, then stop everything.
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) {
        let consumer = self.spawn_underwriting_consumer();
        shutdown.await;
        info!("shutdown signal received");

        self.cancel.cancel();
        match tokio::time::timeout(CONSUMER_STOP_TIMEOUT, consumer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "underwriting consumer ended abnormally"),
            Err(_) => warn!("underwriting consumer did not stop in time"),
        }
        self.shutdown().await;
    }

    /// Cancel background loops and drain pending cache writes.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.layer.writer().shutdown().await;
        info!("background work drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::group_name;
    use insura_core::{OrderStatus, Product};
    use insura_db_memory::InMemoryStore;
    use insura_storage::OrderStore;

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.queue.block_ms = 20;
        config.workflow.underwriting_delay_ms = 0;
        config
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = AppConfig::default();
        config.server.node_id = 4096;
        let err = App::build(config).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));
    }

    #[tokio::test]
    async fn test_memory_build_uses_local_backends() {
        let app = App::build(fast_config()).await.unwrap();
        assert_eq!(app.cache().backend().mode(), "local");
        assert_eq!(app.queue().broker().mode(), "local");
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_paid_order_is_underwritten_by_consumer() {
        let store = Arc::new(InMemoryStore::new());
        let stores = Stores {
            users: store.clone(),
            products: store.clone(),
            orders: store.clone(),
            chats: store.clone(),
        };
        let app = App::assemble(fast_config(), stores, None).unwrap();
        app.repositories()
            .products
            .create(&Product::new(3, "travel basic", "travel", 4_900))
            .await
            .unwrap();
        let consumer = app.spawn_underwriting_consumer();

        let order = app.orders().create_order(7, 3).await.unwrap();
        app.orders().pay_order(7, order.id).await.unwrap();

        let stream = app.config().workflow.order_stream.clone();
        let group = group_name(&stream);
        let mut status = OrderStatus::Paid;
        for _ in 0..200 {
            let pending = app.queue().broker().pending(&stream, &group, 10).await.unwrap();
            let stored = OrderStore::find_by_id(store.as_ref(), order.id).await.unwrap().unwrap();
            status = stored.status;
            if pending.is_empty() && status == OrderStatus::Active {
                assert!(stored.policy_number.unwrap().starts_with("POL-"));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, OrderStatus::Active);

        app.cancel_token().cancel();
        tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        app.shutdown().await;
    }
}

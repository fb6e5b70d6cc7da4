//! Cache-aside behaviour of the repositories against the local backends and
//! the in-memory store.

use async_trait::async_trait;
use insura_core::Product;
use insura_db_memory::InMemoryStore;
use insura_server::cache::{
    BackgroundWriter, CacheBackend, CacheLayer, LockManager, RetryPolicy, keys,
};
use insura_server::config::CacheConfig;
use insura_server::repository::ProductRepository;
use insura_storage::{ProductQuery, ProductStore, StorageError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Product store that counts lookups and can be slowed down.
struct CountingStore {
    inner: InMemoryStore,
    lookups: AtomicUsize,
    delay: Duration,
}

impl CountingStore {
    fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            lookups: AtomicUsize::new(0),
            delay,
        }
    }

    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProductStore for CountingStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Product>, StorageError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        ProductStore::find_by_id(&self.inner, id).await
    }

    async fn list(&self, query: &ProductQuery) -> Result<Vec<Product>, StorageError> {
        self.inner.list(query).await
    }

    async fn count(&self, category: Option<&str>) -> Result<u64, StorageError> {
        self.inner.count(category).await
    }

    async fn create(&self, product: &Product) -> Result<(), StorageError> {
        ProductStore::create(&self.inner, product).await
    }
}

fn layer_over(backend: CacheBackend, locks: LockManager) -> CacheLayer {
    let config = CacheConfig::default();
    CacheLayer::new(
        backend,
        locks,
        BackgroundWriter::new(config.max_inflight_writes, config.write_timeout()),
        &config,
        CancellationToken::new(),
    )
}

fn local_layer() -> CacheLayer {
    layer_over(
        CacheBackend::new_local(),
        LockManager::new_local(RetryPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 20,
        }),
    )
}

async fn seeded_store(delay: Duration) -> Arc<CountingStore> {
    let store = Arc::new(CountingStore::new(delay));
    store
        .create(&Product::new(3, "travel basic", "travel", 4_900))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_concurrent_misses_load_store_once() {
    let store = seeded_store(Duration::from_millis(50)).await;
    let layer = local_layer();
    let repo = Arc::new(ProductRepository::new(store.clone(), layer.clone()));

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let repo = Arc::clone(&repo);
            tokio::spawn(async move { repo.find_by_id(3).await })
        })
        .collect();
    for handle in handles {
        let product = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(product.name, "travel basic");
    }
    assert_eq!(store.lookups(), 1);

    layer.writer().flush().await;
    assert!(repo.cache().get_by_id(3).await.is_some());
    assert_eq!(layer.stats().written(), 1);

    // Served from cache from now on.
    repo.find_by_id(3).await.unwrap();
    assert_eq!(store.lookups(), 1);
}

#[tokio::test]
async fn test_instances_sharing_a_cache_write_once() {
    // Two repositories stand in for two processes: separate coalescers,
    // shared cache and lock manager.
    let store = seeded_store(Duration::from_millis(20)).await;
    let layer = local_layer();
    let first = ProductRepository::new(store.clone(), layer.clone());
    let second = ProductRepository::new(store.clone(), layer.clone());

    let (a, b) = tokio::join!(first.find_by_id(3), second.find_by_id(3));
    assert!(a.unwrap().is_some());
    assert!(b.unwrap().is_some());
    assert_eq!(store.lookups(), 2);

    // Both instances repopulate; the lock and re-check let only one write.
    layer.writer().flush().await;
    assert_eq!(layer.stats().written(), 1);
    assert_eq!(layer.stats().skipped(), 1);
    assert_eq!(layer.stats().failed(), 0);
    let ttl = layer
        .backend()
        .ttl(&keys::product_by_id(3))
        .await
        .unwrap()
        .unwrap();
    assert!(ttl > Duration::from_secs(3500));
    // The lock was released on the way out.
    assert!(
        layer
            .locks()
            .acquire(&keys::lock_for(&keys::product_by_id(3)), Duration::from_millis(50))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_repopulated_entries_have_jittered_ttls() {
    let store = Arc::new(CountingStore::new(Duration::ZERO));
    for id in 1..=40 {
        store
            .create(&Product::new(id, format!("plan-{id}"), "health", 1_000))
            .await
            .unwrap();
    }
    let layer = local_layer();
    let repo = ProductRepository::new(store.clone(), layer.clone());
    for id in 1..=40 {
        repo.find_by_id(id).await.unwrap();
    }
    layer.writer().flush().await;

    let mut ttls = Vec::new();
    for id in 1..=40 {
        let ttl = layer
            .backend()
            .ttl(&keys::product_by_id(id))
            .await
            .unwrap()
            .unwrap();
        assert!(ttl <= Duration::from_secs(3600 + 180));
        ttls.push(ttl);
    }
    let spread = *ttls.iter().max().unwrap() - *ttls.iter().min().unwrap();
    assert!(spread > Duration::from_secs(30), "ttls not spread: {spread:?}");
}

#[tokio::test]
async fn test_corrupt_entry_is_healed_from_store() {
    let store = seeded_store(Duration::ZERO).await;
    let layer = local_layer();
    let repo = ProductRepository::new(store.clone(), layer.clone());
    let key = keys::product_by_id(3);

    layer
        .backend()
        .set(&key, b"{not json".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();

    let product = repo.find_by_id(3).await.unwrap().unwrap();
    assert_eq!(product.base_price_cents, 4_900);
    assert_eq!(store.lookups(), 1);

    layer.writer().flush().await;
    let healed = repo.cache().get_by_id(3).await.unwrap();
    assert_eq!(healed.name, "travel basic");
}

#[tokio::test]
async fn test_missing_product_is_not_cached() {
    let store = seeded_store(Duration::ZERO).await;
    let layer = local_layer();
    let repo = ProductRepository::new(store.clone(), layer.clone());

    assert!(repo.find_by_id(404).await.unwrap().is_none());
    layer.writer().flush().await;
    assert!(!layer.contains(&keys::product_by_id(404)).await);
}

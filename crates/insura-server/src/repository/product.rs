use insura_core::Product;
use insura_storage::{DynProductStore, Page, ProductQuery};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::RepositoryError;
use crate::cache::{CacheLayer, Coalescer, ProductCache, keys};

/// Catalog reads. Single products are cached; listings are only coalesced.
pub struct ProductRepository {
    store: DynProductStore,
    cache: ProductCache,
    layer: CacheLayer,
    loads: Coalescer<Option<Product>, RepositoryError>,
    counts: Coalescer<u64, RepositoryError>,
    pages: Coalescer<Vec<Product>, RepositoryError>,
}

impl std::fmt::Debug for ProductRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductRepository")
            .field("loads", &self.loads)
            .field("counts", &self.counts)
            .field("pages", &self.pages)
            .finish_non_exhaustive()
    }
}

impl ProductRepository {
    pub fn new(store: DynProductStore, layer: CacheLayer) -> Self {
        Self {
            store,
            cache: ProductCache::new(layer.clone()),
            layer,
            loads: Coalescer::new(),
            counts: Coalescer::new(),
            pages: Coalescer::new(),
        }
    }

    pub fn cache(&self) -> &ProductCache {
        &self.cache
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: i64) -> Result<Option<Product>, RepositoryError> {
        if let Some(product) = self.cache.get_by_id(id).await {
            return Ok(Some(product));
        }
        debug!(product_id = id, "product cache miss");
        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let layer = self.layer.clone();
        self.loads
            .run(&format!("product:find_by_id:{id}"), move || async move {
                let product = store.find_by_id(id).await?;
                if let Some(product) = &product {
                    let key = keys::product_by_id(id);
                    let check = layer.clone();
                    let product = product.clone();
                    layer.repopulate(
                        "product_repopulate",
                        keys::lock_for(&key),
                        async move { check.contains(&key).await },
                        async move { cache.set(&product).await },
                    );
                }
                Ok(product)
            })
            .await
    }

    /// One page of the catalog plus the total count for the same filter.
    ///
    /// The count and the page are coalesced separately, so concurrent
    /// listings of different pages share one count query.
    #[instrument(skip(self))]
    pub async fn list(&self, query: &ProductQuery) -> Result<Page<Product>, RepositoryError> {
        let category = query.category().unwrap_or_default().to_string();

        let count_key = format!("product:list:count:{category}");
        let page_key = format!("product:list:data:{}:{}:{category}", query.offset, query.limit);

        let store = Arc::clone(&self.store);
        let count_category = query.category().map(str::to_string);
        let total = self.counts.run(&count_key, move || async move {
            Ok(store.count(count_category.as_deref()).await?)
        });

        let store = Arc::clone(&self.store);
        let page_query = query.clone();
        let items = self.pages.run(&page_key, move || async move {
            Ok(store.list(&page_query).await?)
        });

        let (total, items) = tokio::try_join!(total, items)?;
        Ok(Page::new(items, total))
    }

    pub async fn create(&self, product: &Product) -> Result<(), RepositoryError> {
        self.store.create(product).await?;
        Ok(())
    }
}

use insura_core::Product;

use super::backend::CacheError;
use super::keys;
use super::layer::CacheLayer;

#[derive(Debug, Clone)]
pub struct ProductCache {
    layer: CacheLayer,
}

impl ProductCache {
    pub fn new(layer: CacheLayer) -> Self {
        Self { layer }
    }

    pub async fn get_by_id(&self, id: i64) -> Option<Product> {
        self.layer.read_json(&keys::product_by_id(id)).await
    }

    pub async fn set(&self, product: &Product) -> Result<(), CacheError> {
        self.layer
            .write_json(&keys::product_by_id(product.id), product)
            .await
    }

    pub async fn delete(&self, id: i64) -> Result<(), CacheError> {
        self.layer.backend().delete(&keys::product_by_id(id)).await
    }
}

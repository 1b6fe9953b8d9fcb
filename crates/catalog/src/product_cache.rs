//! Read-through cache of product details under `product:{id}`.

use crate::popularity::record_view;
use flashsale_core::keys;
use flashsale_core::store::{CounterStore, ProductRepository};
use flashsale_core::types::{ProductDetail, ProductId};
use flashsale_core::FlashSaleResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ProductDetailCache {
    store: Arc<dyn CounterStore>,
    products: Arc<dyn ProductRepository>,
    ttl: Duration,
}

impl ProductDetailCache {
    pub fn new(
        store: Arc<dyn CounterStore>,
        products: Arc<dyn ProductRepository>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            products,
            ttl,
        }
    }

    /// Nominal lifetime of a cached product.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a product. Each product served counts as one view; unknown
    /// ids never enter the ranking.
    pub async fn get_product(&self, product_id: ProductId) -> FlashSaleResult<Option<ProductDetail>> {
        let product = match self.cached(product_id).await {
            Some(product) => {
                metrics::counter!("product.cache.hit").increment(1);
                Some(product)
            }
            None => {
                metrics::counter!("product.cache.miss").increment(1);
                self.reload(product_id).await?
            }
        };

        if product.is_some() {
            if let Err(e) = record_view(self.store.as_ref(), product_id).await {
                warn!(product_id = product_id, error = %e, "Failed to track product view");
            }
        }
        Ok(product)
    }

    /// Fetch from the durable store and re-cache with the full TTL.
    /// A product that no longer exists is evicted.
    pub async fn reload(&self, product_id: ProductId) -> FlashSaleResult<Option<ProductDetail>> {
        let key = keys::product(product_id);
        let Some(product) = self.products.find_product(product_id).await? else {
            if let Err(e) = self.store.delete(&key).await {
                warn!(product_id = product_id, error = %e, "Failed to evict missing product");
            }
            return Ok(None);
        };

        let json = serde_json::to_string(&product)?;
        if let Err(e) = self.store.set(&key, &json, Some(self.ttl)).await {
            warn!(product_id = product_id, error = %e, "Failed to cache product");
        } else {
            debug!(product_id = product_id, "Product cached");
        }
        Ok(Some(product))
    }

    async fn cached(&self, product_id: ProductId) -> Option<ProductDetail> {
        let key = keys::product(product_id);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(product_id = product_id, error = %e, "Product cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(product) => Some(product),
            Err(e) => {
                warn!(product_id = product_id, error = %e, "Corrupt product entry, evicting");
                if let Err(e) = self.store.delete(&key).await {
                    warn!(product_id = product_id, error = %e, "Failed to evict corrupt product entry");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashsale_cache::InMemoryCounterStore;
    use flashsale_core::store::KeyTtl;
    use flashsale_store::InMemoryDurableStore;

    fn product(id: ProductId) -> ProductDetail {
        ProductDetail {
            id,
            name: format!("product-{id}"),
            description: String::new(),
            price_cents: 1_000,
            discount_percent: 10,
        }
    }

    #[tokio::test]
    async fn test_read_through_caches_and_tracks_views() {
        let counters = Arc::new(InMemoryCounterStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.upsert_product(product(5));
        let cache = ProductDetailCache::new(counters.clone(), durable, Duration::from_secs(600));

        assert_eq!(cache.get_product(5).await.unwrap().unwrap().id, 5);
        assert!(matches!(
            counters.ttl(&keys::product(5)).await.unwrap(),
            KeyTtl::Expires(_)
        ));

        cache.get_product(5).await.unwrap();
        let top = counters.top_scores(keys::POPULAR_PRODUCTS, 1).await.unwrap();
        assert_eq!(top, vec![("5".to_string(), 2.0)]);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_replaced() {
        let counters = Arc::new(InMemoryCounterStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.upsert_product(product(8));
        counters.set(&keys::product(8), "{broken", None).await.unwrap();
        let cache = ProductDetailCache::new(counters.clone(), durable, Duration::from_secs(600));

        assert_eq!(cache.get_product(8).await.unwrap().unwrap().name, "product-8");
        let raw = counters.get(&keys::product(8)).await.unwrap().unwrap();
        assert!(serde_json::from_str::<ProductDetail>(&raw).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_product_is_none() {
        let counters = Arc::new(InMemoryCounterStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        let cache = ProductDetailCache::new(counters.clone(), durable, Duration::from_secs(600));

        assert!(cache.get_product(404).await.unwrap().is_none());
        assert_eq!(counters.get(&keys::product(404)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_ids_do_not_crowd_out_real_products() {
        let counters = Arc::new(InMemoryCounterStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.upsert_product(product(1));
        let cache = ProductDetailCache::new(counters.clone(), durable, Duration::from_secs(600));

        for _ in 0..5 {
            cache.get_product(1).await.unwrap();
        }
        for id in 1000..1020 {
            for _ in 0..6 {
                assert!(cache.get_product(id).await.unwrap().is_none());
            }
        }

        let top = counters.top_scores(keys::POPULAR_PRODUCTS, 20).await.unwrap();
        assert_eq!(top, vec![("1".to_string(), 5.0)]);
    }
}

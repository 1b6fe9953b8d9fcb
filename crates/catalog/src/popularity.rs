//! Refresh-ahead for the most viewed products.
//!
//! Views are scored in a sorted set. Each run walks the top-N products and
//! re-caches any whose entry is missing, persistent, or close to expiry, so
//! hot products never fall out of the cache under load. Members that no
//! longer name a product are dropped and the ranking is trimmed to a bounded
//! size after every pass.

use crate::product_cache::ProductDetailCache;
use async_trait::async_trait;
use flashsale_core::config::PopularityConfig;
use flashsale_core::jobs::PeriodicJob;
use flashsale_core::keys;
use flashsale_core::store::{CounterStore, KeyTtl};
use flashsale_core::types::ProductId;
use flashsale_core::{FlashSaleResult, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Add one view to `product_id`'s popularity score.
pub async fn record_view(store: &dyn CounterStore, product_id: ProductId) -> StoreResult<f64> {
    store
        .increment_score(keys::POPULAR_PRODUCTS, &product_id.to_string(), 1.0)
        .await
}

/// Outcome of one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub inspected: usize,
    pub refreshed: usize,
    pub fresh: usize,
    pub skipped: usize,
    /// Members dropped from the ranking, dead or past the size bound.
    pub pruned: usize,
}

pub struct PopularityRefreshJob {
    store: Arc<dyn CounterStore>,
    products: Arc<ProductDetailCache>,
    interval: Duration,
    top_n: usize,
    max_ranked: usize,
    low_water_mark: Duration,
}

impl PopularityRefreshJob {
    pub fn new(
        store: Arc<dyn CounterStore>,
        products: Arc<ProductDetailCache>,
        config: &PopularityConfig,
    ) -> Self {
        Self {
            store,
            products,
            interval: config.interval(),
            top_n: config.top_n,
            max_ranked: config.max_ranked.max(config.top_n),
            low_water_mark: config.low_water_mark(),
        }
    }

    pub async fn track_view(&self, product_id: ProductId) -> StoreResult<f64> {
        record_view(self.store.as_ref(), product_id).await
    }

    /// One pass over the top-N products. Only reading the ranking itself can
    /// fail the pass; per-product problems are logged and skipped.
    pub async fn run_once(&self) -> FlashSaleResult<RefreshReport> {
        let top = self
            .store
            .top_scores(keys::POPULAR_PRODUCTS, self.top_n)
            .await?;

        let mut report = RefreshReport::default();
        for (member, score) in top {
            report.inspected += 1;

            let Ok(product_id) = member.parse::<ProductId>() else {
                warn!(member = %member, "Non-numeric member in popularity ranking");
                report.skipped += 1;
                report.pruned += self.drop_member(&member).await;
                continue;
            };

            let stale = match self.store.ttl(&keys::product(product_id)).await {
                Ok(KeyTtl::Missing) | Ok(KeyTtl::Persistent) => true,
                Ok(KeyTtl::Expires(left)) => left <= self.low_water_mark,
                Err(e) => {
                    warn!(product_id = product_id, error = %e, "Failed to read product TTL");
                    report.skipped += 1;
                    continue;
                }
            };
            if !stale {
                report.fresh += 1;
                continue;
            }

            match self.products.reload(product_id).await {
                Ok(Some(_)) => {
                    debug!(product_id = product_id, score = score, "Hot product re-cached");
                    report.refreshed += 1;
                }
                Ok(None) => {
                    warn!(product_id = product_id, "Popular product no longer exists");
                    report.skipped += 1;
                    report.pruned += self.drop_member(&member).await;
                }
                Err(e) => {
                    warn!(product_id = product_id, error = %e, "Failed to refresh product");
                    report.skipped += 1;
                }
            }
        }

        match self
            .store
            .trim_scores(keys::POPULAR_PRODUCTS, self.max_ranked)
            .await
        {
            Ok(removed) => report.pruned += removed,
            Err(e) => warn!(error = %e, "Failed to trim popularity ranking"),
        }

        metrics::counter!("popularity.refreshed").increment(report.refreshed as u64);
        metrics::counter!("popularity.pruned").increment(report.pruned as u64);
        info!(
            inspected = report.inspected,
            refreshed = report.refreshed,
            fresh = report.fresh,
            skipped = report.skipped,
            pruned = report.pruned,
            "Popularity refresh completed"
        );
        Ok(report)
    }

    async fn drop_member(&self, member: &str) -> usize {
        match self.store.remove_score(keys::POPULAR_PRODUCTS, member).await {
            Ok(removed) => usize::from(removed),
            Err(e) => {
                warn!(member = %member, error = %e, "Failed to drop ranking member");
                0
            }
        }
    }
}

#[async_trait]
impl PeriodicJob for PopularityRefreshJob {
    fn name(&self) -> &'static str {
        "popularity-refresh"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        PopularityRefreshJob::run_once(self).await?;
        Ok(())
    }
}

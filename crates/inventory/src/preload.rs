//! Startup load of stock counters from the durable store.

use flashsale_core::keys;
use flashsale_core::store::{CounterStore, StockRepository};
use flashsale_core::FlashSaleResult;
use std::sync::Arc;
use tracing::info;

pub struct CounterPreloader {
    counters: Arc<dyn CounterStore>,
    stock: Arc<dyn StockRepository>,
}

impl CounterPreloader {
    pub fn new(counters: Arc<dyn CounterStore>, stock: Arc<dyn StockRepository>) -> Self {
        Self { counters, stock }
    }

    /// Create a counter for every durable stock record that has none.
    /// Existing counters are left alone. Returns how many were created.
    pub async fn preload(&self) -> FlashSaleResult<usize> {
        let records = self.stock.list_stock().await?;
        let mut created = 0;
        for record in &records {
            let value = record.current_value.to_string();
            if self
                .counters
                .set_if_absent(&keys::stock(record.product_id), &value, None)
                .await?
            {
                created += 1;
            }
        }
        info!(records = records.len(), created = created, "Stock counters preloaded");
        Ok(created)
    }
}

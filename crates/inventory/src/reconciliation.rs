//! Periodic write-back of counter values to the durable stock records.
//!
//! The counter store is authoritative while a counter exists; this job copies
//! each `stock:*` value into the durable `current_value` so a restart or an
//! evicted counter reloads a recent figure. Writes are last-writer-wins.

use async_trait::async_trait;
use flashsale_core::config::ReconciliationConfig;
use flashsale_core::jobs::PeriodicJob;
use flashsale_core::keys;
use flashsale_core::store::{parse_counter, CounterStore, StockRepository};
use flashsale_core::FlashSaleResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub scanned: usize,
    pub synced: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct StockReconciliationJob {
    counters: Arc<dyn CounterStore>,
    stock: Arc<dyn StockRepository>,
    interval: Duration,
}

impl StockReconciliationJob {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        stock: Arc<dyn StockRepository>,
        config: &ReconciliationConfig,
    ) -> Self {
        Self {
            counters,
            stock,
            interval: config.interval(),
        }
    }

    /// Sync every counter once. Only listing the keys can fail the batch;
    /// per-key failures are counted in the report.
    pub async fn run_once(&self) -> FlashSaleResult<ReconciliationReport> {
        let keys = self.counters.keys_with_prefix(keys::STOCK_PREFIX).await?;
        let mut report = ReconciliationReport::default();

        for key in keys {
            report.scanned += 1;

            let Some(product_id) = keys::parse_stock(&key) else {
                warn!(key = %key, "Malformed stock key, skipping");
                report.errors += 1;
                continue;
            };

            let raw = match self.counters.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    // Evicted since the scan.
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read stock counter");
                    report.errors += 1;
                    continue;
                }
            };

            let value = match parse_counter(&key, &raw) {
                Ok(value) => value,
                Err(e) => {
                    warn!(key = %key, error = %e, "Invalid stock counter, skipping");
                    report.errors += 1;
                    continue;
                }
            };

            match self.stock.find_stock(product_id).await {
                Ok(Some(record)) if record.current_value == value => {
                    report.unchanged += 1;
                }
                Ok(Some(record)) => match self.stock.update_current_value(product_id, value).await {
                    Ok(true) => {
                        debug!(
                            product_id = product_id,
                            from = record.current_value,
                            to = value,
                            "Durable stock synced"
                        );
                        report.synced += 1;
                    }
                    Ok(false) => {
                        warn!(product_id = product_id, "Stock record vanished during sync");
                        report.skipped += 1;
                    }
                    Err(e) => {
                        warn!(product_id = product_id, error = %e, "Failed to write durable stock");
                        report.errors += 1;
                    }
                },
                Ok(None) => {
                    warn!(product_id = product_id, "Counter has no durable stock record");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(product_id = product_id, error = %e, "Failed to read durable stock");
                    report.errors += 1;
                }
            }
        }

        metrics::counter!("reconciliation.synced").increment(report.synced as u64);
        metrics::counter!("reconciliation.errors").increment(report.errors as u64);
        info!(
            scanned = report.scanned,
            synced = report.synced,
            unchanged = report.unchanged,
            skipped = report.skipped,
            errors = report.errors,
            "Stock reconciliation completed"
        );
        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for StockReconciliationJob {
    fn name(&self) -> &'static str {
        "stock-reconciliation"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        StockReconciliationJob::run_once(self).await?;
        Ok(())
    }
}

//! In-memory durable store backed by DashMap.
//!
//! Production: replace with the relational store owned by the CRUD layer.
//! This provides the same repository surface for development and testing.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use flashsale_core::store::{
    CouponRepository, FlashSaleRepository, OrderRepository, ProductRepository, StockRepository,
    StockRowLock,
};
use flashsale_core::types::{
    CouponRecord, DurableStockRecord, FlashSaleWindow, NewOrder, Order, ProductDetail, ProductId,
    WindowId,
};
use flashsale_core::{FlashSaleError, FlashSaleResult};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

struct StockRow {
    record: DurableStockRecord,
    lock: Arc<Mutex<()>>,
}

/// Thread-safe in-memory store for stock, coupons, flash-sale windows,
/// products and orders.
pub struct InMemoryDurableStore {
    stock: DashMap<ProductId, StockRow>,
    coupons: DashMap<String, CouponRecord>,
    windows: DashMap<WindowId, FlashSaleWindow>,
    products: DashMap<ProductId, ProductDetail>,
    orders: DashMap<Uuid, Order>,
    failing_writes: AtomicU32,
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self {
            stock: DashMap::new(),
            coupons: DashMap::new(),
            windows: DashMap::new(),
            products: DashMap::new(),
            orders: DashMap::new(),
            failing_writes: AtomicU32::new(0),
        }
    }

    /// Store pre-populated with a running sale, for development runs.
    pub fn with_demo_data() -> Self {
        let store = Self::new();
        store.seed_demo_data();
        info!("Durable store initialized (in-memory, development mode)");
        store
    }

    /// Make the next `count` writes fail as if the database were down.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> FlashSaleResult<()> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(FlashSaleError::Durable("write rejected: store unavailable".into()));
        }
        Ok(())
    }

    // ─── Stock ─────────────────────────────────────────────────────────────

    /// Provision stock for a product. Resets both total and current value.
    pub fn upsert_stock(&self, product_id: ProductId, total_stock: i64) {
        let record = DurableStockRecord {
            product_id,
            total_stock,
            current_value: total_stock,
            updated_at: Utc::now(),
        };
        match self.stock.get_mut(&product_id) {
            Some(mut row) => row.record = record,
            None => {
                self.stock.insert(
                    product_id,
                    StockRow {
                        record,
                        lock: Arc::new(Mutex::new(())),
                    },
                );
            }
        }
    }

    // ─── Coupons ───────────────────────────────────────────────────────────

    pub fn upsert_coupon(&self, coupon: CouponRecord) {
        self.coupons.insert(coupon.code.clone(), coupon);
    }

    // ─── Flash-sale windows ────────────────────────────────────────────────

    pub fn upsert_window(&self, window: FlashSaleWindow) {
        self.windows.insert(window.id, window);
    }

    pub fn delete_window(&self, id: WindowId) -> bool {
        self.windows.remove(&id).is_some()
    }

    // ─── Products & orders ─────────────────────────────────────────────────

    pub fn upsert_product(&self, product: ProductDetail) {
        self.products.insert(product.id, product);
    }

    pub fn list_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.iter().map(|r| r.value().clone()).collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    fn seed_demo_data(&self) {
        let now = Utc::now();
        let catalog = [
            (1, "Noise-cancelling headphones", 19_900, 30, 100),
            (2, "Mechanical keyboard", 12_900, 20, 50),
            (3, "4K monitor", 34_900, 15, 25),
            (4, "USB-C dock", 8_900, 0, 500),
        ];
        for (id, name, price_cents, discount_percent, stock) in catalog {
            self.upsert_product(ProductDetail {
                id,
                name: name.to_string(),
                description: format!("{name} (demo)"),
                price_cents,
                discount_percent,
            });
            self.upsert_stock(id, stock);
        }

        self.upsert_window(FlashSaleWindow {
            id: 1,
            name: "Midnight madness".to_string(),
            start_at: now - ChronoDuration::minutes(5),
            end_at: now + ChronoDuration::hours(2),
            product_ids: [1, 2, 3].into_iter().collect(),
        });
        self.upsert_window(FlashSaleWindow {
            id: 2,
            name: "Weekend deals".to_string(),
            start_at: now + ChronoDuration::days(1),
            end_at: now + ChronoDuration::days(2),
            product_ids: [4].into_iter().collect(),
        });

        for (code, discount) in [("WELCOME10", 10), ("FLASH25", 25)] {
            self.upsert_coupon(CouponRecord {
                code: code.to_string(),
                discount,
                valid_until: now + ChronoDuration::days(7),
                used: false,
            });
        }
    }
}

#[async_trait]
impl StockRepository for InMemoryDurableStore {
    async fn find_stock(&self, product_id: ProductId) -> FlashSaleResult<Option<DurableStockRecord>> {
        Ok(self.stock.get(&product_id).map(|r| r.record.clone()))
    }

    async fn lock_stock(&self, product_id: ProductId) -> FlashSaleResult<Option<StockRowLock>> {
        // Clone the row mutex out first; holding a map guard across the
        // await would block the whole shard.
        let Some(lock) = self.stock.get(&product_id).map(|r| r.lock.clone()) else {
            return Ok(None);
        };
        let guard = lock.lock_owned().await;
        let record = self.stock.get(&product_id).map(|r| r.record.clone());
        Ok(record.map(|record| StockRowLock::new(record, guard)))
    }

    async fn update_current_value(&self, product_id: ProductId, value: i64) -> FlashSaleResult<bool> {
        self.check_write()?;
        let Some(mut row) = self.stock.get_mut(&product_id) else {
            return Ok(false);
        };
        row.record.current_value = value;
        row.record.updated_at = Utc::now();
        debug!(product_id = product_id, value = value, "Stock current value updated");
        Ok(true)
    }

    async fn list_stock(&self) -> FlashSaleResult<Vec<DurableStockRecord>> {
        let mut records: Vec<DurableStockRecord> =
            self.stock.iter().map(|r| r.record.clone()).collect();
        records.sort_by_key(|r| r.product_id);
        Ok(records)
    }
}

#[async_trait]
impl CouponRepository for InMemoryDurableStore {
    async fn find_coupon(&self, code: &str) -> FlashSaleResult<Option<CouponRecord>> {
        Ok(self.coupons.get(code).map(|r| r.value().clone()))
    }

    async fn mark_used(&self, code: &str) -> FlashSaleResult<bool> {
        self.check_write()?;
        Ok(self
            .coupons
            .get_mut(code)
            .map(|mut entry| entry.value_mut().used = true)
            .is_some())
    }
}

#[async_trait]
impl FlashSaleRepository for InMemoryDurableStore {
    async fn find_all_windows(&self) -> FlashSaleResult<Vec<FlashSaleWindow>> {
        let mut windows: Vec<FlashSaleWindow> =
            self.windows.iter().map(|r| r.value().clone()).collect();
        windows.sort_by_key(|w| w.id);
        Ok(windows)
    }

    async fn find_window(&self, id: WindowId) -> FlashSaleResult<Option<FlashSaleWindow>> {
        Ok(self.windows.get(&id).map(|r| r.value().clone()))
    }
}

#[async_trait]
impl ProductRepository for InMemoryDurableStore {
    async fn find_product(&self, product_id: ProductId) -> FlashSaleResult<Option<ProductDetail>> {
        Ok(self.products.get(&product_id).map(|r| r.value().clone()))
    }
}

#[async_trait]
impl OrderRepository for InMemoryDurableStore {
    async fn create_order(&self, order: NewOrder) -> FlashSaleResult<Order> {
        self.check_write()?;
        let created = Order {
            id: Uuid::new_v4(),
            user_id: order.user_id,
            total_cents: order.total_cents(),
            lines: order.lines,
            created_at: Utc::now(),
        };
        self.orders.insert(created.id, created.clone());
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stock_row_lock_serializes_holders() {
        let store = Arc::new(InMemoryDurableStore::new());
        store.upsert_stock(7, 10);

        let first = store.lock_stock(7).await.unwrap().unwrap();
        assert_eq!(first.record().current_value, 10);

        let contender = {
            let store = store.clone();
            tokio::spawn(async move { store.lock_stock(7).await.unwrap().map(|l| l.record().clone()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        let record = contender.await.unwrap().unwrap();
        assert_eq!(record.product_id, 7);
    }

    #[tokio::test]
    async fn test_missing_rows() {
        let store = InMemoryDurableStore::new();
        assert!(store.lock_stock(1).await.unwrap().is_none());
        assert!(!store.update_current_value(1, 5).await.unwrap());
        assert!(!store.mark_used("NOPE").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_write_failures_are_consumed() {
        let store = InMemoryDurableStore::new();
        store.upsert_stock(1, 10);
        store.fail_next_writes(1);

        assert!(matches!(
            store.update_current_value(1, 4).await,
            Err(FlashSaleError::Durable(_))
        ));
        assert!(store.update_current_value(1, 4).await.unwrap());
        assert_eq!(store.find_stock(1).await.unwrap().unwrap().current_value, 4);
    }

    #[tokio::test]
    async fn test_demo_data_has_an_active_window() {
        let store = InMemoryDurableStore::with_demo_data();
        let now = Utc::now();
        let windows = store.find_all_windows().await.unwrap();
        assert!(windows.iter().any(|w| w.is_active_at(now)));
        assert_eq!(store.list_stock().await.unwrap().len(), 4);
    }
}

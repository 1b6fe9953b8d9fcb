//! Store capabilities the engine is written against.
//!
//! [`CounterStore`] is the fast shared key-value store (Redis in production,
//! an in-process map in tests). The repository traits are the durable
//! collaborators owned by the CRUD layer.

use crate::error::{FlashSaleResult, StoreError, StoreResult};
use crate::types::{
    CouponRecord, DurableStockRecord, FlashSaleWindow, NewOrder, Order, ProductDetail, ProductId,
    WindowId,
};
use async_trait::async_trait;
use std::time::Duration;

/// Attempts made by [`cas_decrement`] when a store relies on the default
/// [`CounterStore::decrement_if_sufficient`].
pub const DEFAULT_CAS_ATTEMPTS: u32 = 16;

/// Result of a conditional decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// The decrement was applied; `remaining` is the new value.
    Committed { remaining: i64 },
    /// The counter holds less than requested. Nothing changed.
    Insufficient { available: i64 },
    /// The key does not exist.
    Missing,
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// Narrow capability over the fast counter store.
///
/// Every method is one round trip. Implementations must make
/// `set_if_absent`, `increment_by`, `compare_and_set` and
/// `decrement_if_sufficient` atomic per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Returns `true` when the key was created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> StoreResult<bool>;

    /// Returns `true` when a key was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// Adds `delta` (may be negative), creating the key at 0 if missing.
    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Replaces the value only if it currently equals `expected`. A missing
    /// key never matches. TTL is preserved.
    async fn compare_and_set(&self, key: &str, expected: &str, new: &str) -> StoreResult<bool>;

    /// Decrements by `quantity` only if the current value is at least
    /// `quantity`, as one indivisible step.
    ///
    /// The default runs [`cas_decrement`], for stores without server-side
    /// scripting. Backends that can do better override it.
    async fn decrement_if_sufficient(
        &self,
        key: &str,
        quantity: i64,
    ) -> StoreResult<DecrementOutcome> {
        cas_decrement(self, key, quantity, DEFAULT_CAS_ATTEMPTS).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Replaces the set stored at `key` with `members`.
    async fn replace_set(&self, key: &str, members: &[String], ttl: Option<Duration>)
        -> StoreResult<()>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Adds `delta` to `member`'s score in the sorted set at `key`.
    async fn increment_score(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64>;

    /// Highest-scored members first.
    async fn top_scores(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, f64)>>;

    /// Returns `true` when `member` was in the sorted set.
    async fn remove_score(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Keep only the `keep` highest-scored members. Returns how many were
    /// removed.
    async fn trim_scores(&self, key: &str, keep: usize) -> StoreResult<usize>;
}

/// Conditional decrement built from `get` + `compare_and_set`.
///
/// Never oversells: a write only lands if the value is still the one that
/// was checked. Under contention it may give up after `max_attempts` with
/// [`StoreError::Contended`] even though stock remains, which a true
/// server-side decrement never does.
pub async fn cas_decrement<S>(
    store: &S,
    key: &str,
    quantity: i64,
    max_attempts: u32,
) -> StoreResult<DecrementOutcome>
where
    S: CounterStore + ?Sized,
{
    for _ in 0..max_attempts.max(1) {
        let Some(raw) = store.get(key).await? else {
            return Ok(DecrementOutcome::Missing);
        };
        let current = parse_counter(key, &raw)?;
        if current < quantity {
            return Ok(DecrementOutcome::Insufficient { available: current });
        }
        let remaining = current - quantity;
        if store
            .compare_and_set(key, &raw, &remaining.to_string())
            .await?
        {
            return Ok(DecrementOutcome::Committed { remaining });
        }
        tokio::task::yield_now().await;
    }

    Err(StoreError::Contended {
        key: key.to_string(),
        attempts: max_attempts.max(1),
    })
}

/// Parse an integer counter value, naming the key on failure.
pub fn parse_counter(key: &str, raw: &str) -> StoreResult<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| StoreError::NotAnInteger {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

/// A held row lock on a durable stock record. The lock is released on drop.
pub struct StockRowLock {
    record: DurableStockRecord,
    _guard: Box<dyn Send + Sync>,
}

impl StockRowLock {
    pub fn new(record: DurableStockRecord, guard: impl Send + Sync + 'static) -> Self {
        Self {
            record,
            _guard: Box::new(guard),
        }
    }

    pub fn record(&self) -> &DurableStockRecord {
        &self.record
    }
}

#[async_trait]
pub trait StockRepository: Send + Sync {
    async fn find_stock(&self, product_id: ProductId) -> FlashSaleResult<Option<DurableStockRecord>>;

    /// Lock the stock row for `product_id` until the returned guard drops.
    async fn lock_stock(&self, product_id: ProductId) -> FlashSaleResult<Option<StockRowLock>>;

    /// Overwrite `current_value`. Returns `false` when no row exists.
    async fn update_current_value(&self, product_id: ProductId, value: i64) -> FlashSaleResult<bool>;

    async fn list_stock(&self) -> FlashSaleResult<Vec<DurableStockRecord>>;
}

#[async_trait]
pub trait CouponRepository: Send + Sync {
    async fn find_coupon(&self, code: &str) -> FlashSaleResult<Option<CouponRecord>>;

    /// Returns `false` when the coupon does not exist.
    async fn mark_used(&self, code: &str) -> FlashSaleResult<bool>;
}

#[async_trait]
pub trait FlashSaleRepository: Send + Sync {
    async fn find_all_windows(&self) -> FlashSaleResult<Vec<FlashSaleWindow>>;

    async fn find_window(&self, id: WindowId) -> FlashSaleResult<Option<FlashSaleWindow>>;
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn find_product(&self, product_id: ProductId) -> FlashSaleResult<Option<ProductDetail>>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create_order(&self, order: NewOrder) -> FlashSaleResult<Order>;
}

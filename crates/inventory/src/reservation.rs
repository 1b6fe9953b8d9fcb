//! Atomic stock reservation against the counter store.
//!
//! A reservation is one conditional decrement: the store checks the quantity
//! and applies it in the same step, so the counter never goes negative and
//! concurrent buyers can never sum above the stock that was loaded. The
//! durable store is only read on cold start and is never decremented here.

use flashsale_core::keys;
use flashsale_core::store::{parse_counter, CounterStore, DecrementOutcome, StockRepository};
use flashsale_core::types::{OrderLine, ProductId};
use flashsale_core::{FlashSaleError, FlashSaleResult};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of reserving stock for one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved { remaining: i64 },
    OutOfStock { available: i64 },
    NotFound,
}

impl Reservation {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Reservation::Reserved { .. })
    }
}

/// Result of reserving a multi-line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderReservation {
    /// Every line is held.
    Reserved,
    /// Line `index` was refused; every earlier line has been released.
    Rejected {
        index: usize,
        line: OrderLine,
        outcome: Reservation,
    },
}

pub struct StockReservationService {
    counters: Arc<dyn CounterStore>,
    stock: Arc<dyn StockRepository>,
}

impl StockReservationService {
    pub fn new(counters: Arc<dyn CounterStore>, stock: Arc<dyn StockRepository>) -> Self {
        Self { counters, stock }
    }

    /// Reserve `quantity` units of `product_id`.
    ///
    /// Store failures are returned as errors; there is no fallback path that
    /// could oversell.
    pub async fn reserve(&self, product_id: ProductId, quantity: u32) -> FlashSaleResult<Reservation> {
        if quantity == 0 {
            return Err(FlashSaleError::Validation(format!(
                "quantity for product {product_id} must be positive"
            )));
        }

        let key = keys::stock(product_id);
        let amount = i64::from(quantity);

        let outcome = match self.counters.decrement_if_sufficient(&key, amount).await? {
            DecrementOutcome::Missing => {
                if !self.initialize_counter(product_id, &key).await? {
                    DecrementOutcome::Missing
                } else {
                    // One retry only; a key evicted again in between reads as missing.
                    self.counters.decrement_if_sufficient(&key, amount).await?
                }
            }
            outcome => outcome,
        };

        let reservation = match outcome {
            DecrementOutcome::Committed { remaining } => {
                metrics::counter!("inventory.reserved").increment(1);
                debug!(product_id = product_id, quantity = quantity, remaining = remaining, "Stock reserved");
                Reservation::Reserved { remaining }
            }
            DecrementOutcome::Insufficient { available } => {
                metrics::counter!("inventory.out_of_stock").increment(1);
                debug!(product_id = product_id, quantity = quantity, available = available, "Insufficient stock");
                Reservation::OutOfStock { available }
            }
            DecrementOutcome::Missing => {
                metrics::counter!("inventory.not_found").increment(1);
                debug!(product_id = product_id, "No stock record");
                Reservation::NotFound
            }
        };
        Ok(reservation)
    }

    /// Load the counter from the durable record under its row lock.
    /// Returns `false` when the product has no stock record.
    async fn initialize_counter(&self, product_id: ProductId, key: &str) -> FlashSaleResult<bool> {
        let Some(lock) = self.stock.lock_stock(product_id).await? else {
            return Ok(false);
        };

        let value = lock.record().current_value;
        // Another node may have initialized and already sold from the
        // counter; never overwrite it.
        if self.counters.set_if_absent(key, &value.to_string(), None).await? {
            metrics::counter!("inventory.cold_start").increment(1);
            info!(product_id = product_id, value = value, "Stock counter initialized from durable store");
        }
        Ok(true)
    }

    /// Reserve every line or none.
    ///
    /// Lines are reserved in request order. On the first refusal or error the
    /// lines already held are released in reverse order before returning.
    pub async fn reserve_order(&self, lines: &[OrderLine]) -> FlashSaleResult<OrderReservation> {
        if lines.is_empty() {
            return Err(FlashSaleError::Validation("order has no lines".into()));
        }
        if let Some(line) = lines.iter().find(|l| l.quantity == 0) {
            return Err(FlashSaleError::Validation(format!(
                "quantity for product {} must be positive",
                line.product_id
            )));
        }

        for (index, line) in lines.iter().enumerate() {
            match self.reserve(line.product_id, line.quantity).await {
                Ok(Reservation::Reserved { .. }) => {}
                Ok(outcome) => {
                    self.compensate(&lines[..index]).await;
                    return Ok(OrderReservation::Rejected {
                        index,
                        line: *line,
                        outcome,
                    });
                }
                Err(e) => {
                    warn!(product_id = line.product_id, error = %e, "Reservation failed, rolling back order");
                    self.compensate(&lines[..index]).await;
                    return Err(e);
                }
            }
        }

        Ok(OrderReservation::Reserved)
    }

    /// Release `lines` in reverse order. Returns how many releases failed.
    pub async fn compensate(&self, lines: &[OrderLine]) -> usize {
        let mut failed = 0;
        for line in lines.iter().rev() {
            match self.release(line.product_id, line.quantity).await {
                Ok(_) => {
                    metrics::counter!("inventory.compensated").increment(1);
                }
                Err(e) => {
                    failed += 1;
                    metrics::counter!("inventory.compensation_failed").increment(1);
                    error!(
                        product_id = line.product_id,
                        quantity = line.quantity,
                        error = %e,
                        "Failed to release reserved stock"
                    );
                }
            }
        }
        failed
    }

    /// Return `quantity` units to the counter. Returns the new value.
    pub async fn release(&self, product_id: ProductId, quantity: u32) -> FlashSaleResult<i64> {
        if quantity == 0 {
            return Err(FlashSaleError::Validation(format!(
                "quantity for product {product_id} must be positive"
            )));
        }
        let remaining = self
            .counters
            .increment_by(&keys::stock(product_id), i64::from(quantity))
            .await?;
        debug!(product_id = product_id, quantity = quantity, remaining = remaining, "Stock released");
        Ok(remaining)
    }

    /// Current counter value, or `None` if the counter is not loaded.
    pub async fn available(&self, product_id: ProductId) -> FlashSaleResult<Option<i64>> {
        let key = keys::stock(product_id);
        let Some(raw) = self.counters.get(&key).await? else {
            return Ok(None);
        };
        Ok(Some(parse_counter(&key, &raw)?))
    }
}

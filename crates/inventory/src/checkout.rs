//! Flash-sale purchase flow: window check, atomic reservation, order write.

use crate::reservation::{OrderReservation, Reservation, StockReservationService};
use flashsale_catalog::{FlashSaleWindowCache, ProductDetailCache};
use flashsale_core::store::OrderRepository;
use flashsale_core::types::{NewOrder, Order, OrderLine, OrderLineItem, UserId};
use flashsale_core::{FlashSaleError, FlashSaleResult};
use std::sync::Arc;
use tracing::{error, info};

pub struct FlashSaleCheckout {
    reservations: Arc<StockReservationService>,
    windows: Arc<FlashSaleWindowCache>,
    products: Arc<ProductDetailCache>,
    orders: Arc<dyn OrderRepository>,
    require_active_window: bool,
}

impl FlashSaleCheckout {
    pub fn new(
        reservations: Arc<StockReservationService>,
        windows: Arc<FlashSaleWindowCache>,
        products: Arc<ProductDetailCache>,
        orders: Arc<dyn OrderRepository>,
        require_active_window: bool,
    ) -> Self {
        Self {
            reservations,
            windows,
            products,
            orders,
            require_active_window,
        }
    }

    /// Buy `lines` for `user_id`. Either the order is created with every line
    /// reserved, or no stock stays held.
    pub async fn buy(&self, user_id: UserId, lines: Vec<OrderLine>) -> FlashSaleResult<Order> {
        if lines.is_empty() {
            return Err(FlashSaleError::Validation("order has no lines".into()));
        }
        if let Some(line) = lines.iter().find(|l| l.quantity == 0) {
            return Err(FlashSaleError::Validation(format!(
                "quantity for product {} must be positive",
                line.product_id
            )));
        }

        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            if self.require_active_window
                && self
                    .windows
                    .get_window_for_product(line.product_id)
                    .await?
                    .is_none()
            {
                metrics::counter!("checkout.not_on_sale").increment(1);
                return Err(FlashSaleError::NotOnSale(line.product_id));
            }

            let product = self
                .products
                .get_product(line.product_id)
                .await?
                .ok_or_else(|| FlashSaleError::not_found("product", line.product_id))?;

            let unit_price_cents = product.sale_price_cents();
            items.push(OrderLineItem {
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price_cents,
                line_total_cents: unit_price_cents * i64::from(line.quantity),
            });
        }

        match self.reservations.reserve_order(&lines).await? {
            OrderReservation::Reserved => {}
            OrderReservation::Rejected { line, outcome, .. } => {
                metrics::counter!("checkout.rejected").increment(1);
                return Err(match outcome {
                    Reservation::OutOfStock { available } => FlashSaleError::OutOfStock {
                        product_id: line.product_id,
                        requested: line.quantity,
                        available,
                    },
                    Reservation::NotFound | Reservation::Reserved { .. } => {
                        FlashSaleError::not_found("stock", line.product_id)
                    }
                });
            }
        }

        let order = NewOrder {
            user_id,
            lines: items,
        };
        match self.orders.create_order(order).await {
            Ok(order) => {
                metrics::counter!("checkout.completed").increment(1);
                info!(
                    order_id = %order.id,
                    user_id = user_id,
                    lines = order.lines.len(),
                    total_cents = order.total_cents,
                    "Order created"
                );
                Ok(order)
            }
            Err(e) => {
                error!(user_id = user_id, error = %e, "Order write failed, releasing stock");
                self.reservations.compensate(&lines).await;
                Err(e)
            }
        }
    }
}

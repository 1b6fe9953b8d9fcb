use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

pub type ProductId = u64;
pub type WindowId = u64;
pub type UserId = u64;

/// Authoritative stock row for a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableStockRecord {
    pub product_id: ProductId,
    pub total_stock: i64,
    pub current_value: i64,
    pub updated_at: DateTime<Utc>,
}

/// One-time-use coupon as stored durably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponRecord {
    pub code: String,
    /// Discount in percent.
    pub discount: u8,
    pub valid_until: DateTime<Utc>,
    pub used: bool,
}

impl CouponRecord {
    /// A coupon is redeemable while unused and not past `valid_until`.
    pub fn is_redeemable_at(&self, now: DateTime<Utc>) -> bool {
        !self.used && self.valid_until >= now
    }
}

/// A time-boxed sale covering a set of products.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashSaleWindow {
    pub id: WindowId,
    pub name: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub product_ids: BTreeSet<ProductId>,
}

impl FlashSaleWindow {
    /// Both bounds are exclusive: a window starting exactly at `now` has not
    /// started, one ending exactly at `now` has ended.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start_at < now && now < self.end_at
    }

    /// Time left until `end_at`, or `None` once the window has ended.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.end_at <= now {
            return None;
        }
        (self.end_at - now).to_std().ok().filter(|d| !d.is_zero())
    }

    pub fn contains(&self, product_id: ProductId) -> bool {
        self.product_ids.contains(&product_id)
    }
}

/// Product row as served to the purchase path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDetail {
    pub id: ProductId,
    pub name: String,
    pub description: String,
    pub price_cents: i64,
    #[serde(default)]
    pub discount_percent: u8,
}

impl ProductDetail {
    pub fn sale_price_cents(&self) -> i64 {
        let discount = i64::from(self.discount_percent.min(100));
        self.price_cents * (100 - discount) / 100
    }
}

/// A requested line in a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl OrderLine {
    pub fn new(product_id: ProductId, quantity: u32) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub line_total_cents: i64,
}

/// Validated, priced order handed to the order collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub user_id: UserId,
    pub lines: Vec<OrderLineItem>,
}

impl NewOrder {
    pub fn total_cents(&self) -> i64 {
        self.lines.iter().map(|l| l.line_total_cents).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: UserId,
    pub lines: Vec<OrderLineItem>,
    pub total_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> FlashSaleWindow {
        FlashSaleWindow {
            id: 1,
            name: "midnight".to_string(),
            start_at: start,
            end_at: end,
            product_ids: [10, 11].into_iter().collect(),
        }
    }

    #[test]
    fn test_window_bounds_are_strict() {
        let now = Utc::now();
        let hour = ChronoDuration::hours(1);

        assert!(window(now - hour, now + hour).is_active_at(now));
        assert!(!window(now + hour, now + hour * 2).is_active_at(now));
        assert!(!window(now, now + hour).is_active_at(now));
        assert!(!window(now - hour, now).is_active_at(now));
    }

    #[test]
    fn test_remaining_is_none_after_end() {
        let now = Utc::now();
        let w = window(now - ChronoDuration::hours(2), now - ChronoDuration::seconds(1));
        assert_eq!(w.remaining_at(now), None);

        let w = window(now, now + ChronoDuration::seconds(30));
        assert_eq!(w.remaining_at(now), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_coupon_redeemable() {
        let now = Utc::now();
        let mut coupon = CouponRecord {
            code: "SPRING".to_string(),
            discount: 10,
            valid_until: now + ChronoDuration::days(1),
            used: false,
        };
        assert!(coupon.is_redeemable_at(now));

        coupon.used = true;
        assert!(!coupon.is_redeemable_at(now));

        coupon.used = false;
        coupon.valid_until = now - ChronoDuration::seconds(1);
        assert!(!coupon.is_redeemable_at(now));
    }

    #[test]
    fn test_sale_price_applies_discount() {
        let product = ProductDetail {
            id: 1,
            name: "Headphones".to_string(),
            description: String::new(),
            price_cents: 10_000,
            discount_percent: 25,
        };
        assert_eq!(product.sale_price_cents(), 7_500);
    }
}

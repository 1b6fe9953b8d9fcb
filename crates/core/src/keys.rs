//! Counter-store key space. These patterns are shared with every other
//! service that reads or writes the same Redis and must not change.

use crate::types::{ProductId, WindowId};

pub const STOCK_PREFIX: &str = "stock:";
pub const COUPON_CLAIM_PREFIX: &str = "coupon:used:";
pub const COUPON_DATA_PREFIX: &str = "coupon:data:";
pub const WINDOW_PREFIX: &str = "flashsale:event:";
pub const WINDOW_PRODUCTS_PREFIX: &str = "flashsale:products:";
pub const PRODUCT_WINDOW_PREFIX: &str = "flashsale:product:";
pub const ACTIVE_WINDOWS: &str = "flashsales:active";
pub const PRODUCT_PREFIX: &str = "product:";
pub const POPULAR_PRODUCTS: &str = "analytics:popular-products";
pub const JOB_LEASE_PREFIX: &str = "jobs:lease:";

pub fn stock(product_id: ProductId) -> String {
    format!("{STOCK_PREFIX}{product_id}")
}

/// Inverse of [`stock`]. `None` for keys outside the prefix or with a
/// non-numeric id.
pub fn parse_stock(key: &str) -> Option<ProductId> {
    key.strip_prefix(STOCK_PREFIX)?.parse().ok()
}

pub fn coupon_claim(code: &str) -> String {
    format!("{COUPON_CLAIM_PREFIX}{code}")
}

pub fn coupon_data(code: &str) -> String {
    format!("{COUPON_DATA_PREFIX}{code}")
}

pub fn window(id: WindowId) -> String {
    format!("{WINDOW_PREFIX}{id}")
}

pub fn window_products(id: WindowId) -> String {
    format!("{WINDOW_PRODUCTS_PREFIX}{id}")
}

pub fn product_window(product_id: ProductId) -> String {
    format!("{PRODUCT_WINDOW_PREFIX}{product_id}")
}

pub fn product(product_id: ProductId) -> String {
    format!("{PRODUCT_PREFIX}{product_id}")
}

pub fn job_lease(job: &str) -> String {
    format!("{JOB_LEASE_PREFIX}{job}")
}

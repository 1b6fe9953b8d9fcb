#![warn(clippy::unwrap_used)]

pub mod popularity;
pub mod product_cache;
pub mod window_cache;

pub use popularity::{PopularityRefreshJob, RefreshReport};
pub use product_cache::ProductDetailCache;
pub use window_cache::FlashSaleWindowCache;

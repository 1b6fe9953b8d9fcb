#![warn(clippy::unwrap_used)]

pub mod commit;
pub mod lock;
pub mod metadata;

pub use commit::UsageCommitter;
pub use lock::{ClaimOutcome, CouponLockService};
pub use metadata::CouponMetadataCache;

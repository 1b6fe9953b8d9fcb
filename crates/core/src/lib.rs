pub mod config;
pub mod error;
pub mod jobs;
pub mod keys;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{FlashSaleError, FlashSaleResult, StoreError, StoreResult};
pub use store::CounterStore;

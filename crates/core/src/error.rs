use crate::types::ProductId;
use thiserror::Error;

pub type FlashSaleResult<T> = Result<T, FlashSaleError>;
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures raised by a [`CounterStore`](crate::store::CounterStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    #[error("Value at {key} is not an integer: {value}")]
    NotAnInteger { key: String, value: String },

    #[error("Key {key} holds a value of the wrong type")]
    WrongType { key: String },

    #[error("Compare-and-swap on {key} gave up after {attempts} attempts")]
    Contended { key: String, attempts: u32 },

    #[error("Cached value serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum FlashSaleError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Product {product_id} is out of stock: requested {requested}, available {available}")]
    OutOfStock {
        product_id: ProductId,
        requested: u32,
        available: i64,
    },

    #[error("Coupon {0} is already claimed")]
    AlreadyClaimed(String),

    #[error("{0} has expired")]
    Expired(String),

    #[error("Product {0} is not part of an active flash sale")]
    NotOnSale(ProductId),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Counter store contended on {key} after {attempts} attempts")]
    Contended { key: String, attempts: u32 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Durable store error: {0}")]
    Durable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FlashSaleError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        FlashSaleError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for FlashSaleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Contended { key, attempts } => FlashSaleError::Contended { key, attempts },
            other => FlashSaleError::StoreUnavailable(other.to_string()),
        }
    }
}

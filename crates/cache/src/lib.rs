#![warn(clippy::unwrap_used)]

pub mod client;
pub mod local;

pub use client::RedisCounterStore;
pub use local::InMemoryCounterStore;

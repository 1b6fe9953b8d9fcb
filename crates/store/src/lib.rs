pub mod memory;

pub use memory::InMemoryDurableStore;

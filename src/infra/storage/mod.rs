//! Storage backends.

pub mod memory;
pub mod retry;

pub use memory::InMemoryStorage;
pub use retry::RetryingStorage;

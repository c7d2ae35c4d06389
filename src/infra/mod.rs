//! Infrastructure adapters: the task queue, storage backends and dispatchers.

pub mod queue;
pub mod storage;
pub mod dispatcher;

pub use queue::BoundedTaskQueue;
pub use storage::{InMemoryStorage, RetryingStorage};

//! Dispatcher backends.

#[cfg(feature = "tokio-runtime")]
pub mod local;

#[cfg(feature = "tokio-runtime")]
pub use local::{LocalDispatcher, TaskRunner};

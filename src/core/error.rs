//! Error types for scheduler operations.

use thiserror::Error;

use crate::core::context::ContextError;
use crate::core::dispatcher::DispatchError;
use crate::core::machines::MachineError;
use crate::core::storage::StorageError;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Storage façade failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Machine registry failure.
    #[error(transparent)]
    Machines(#[from] MachineError),
    /// Dispatcher failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Wildcard expansion failure.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// `start` called on a running scheduler.
    #[error("scheduler is already running")]
    AlreadyRunning,
    /// Operation requires a running scheduler.
    #[error("scheduler is not running")]
    NotRunning,
    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A scheduler thread could not be spawned.
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

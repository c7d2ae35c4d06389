//! Execution dispatcher abstraction.
//!
//! The scheduler only needs to hand a task to a worker and to ask for a kill;
//! transport and worker-side execution live behind [`Dispatcher`].

use std::sync::Arc;

use thiserror::Error;

use crate::core::task::{Task, TaskId};

/// Errors produced when talking to workers.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The task could not be handed to its worker.
    #[error("failed to send task {task_id}: {reason}")]
    Send {
        /// Task being sent.
        task_id: TaskId,
        /// Transport detail.
        reason: String,
    },
    /// Kill requested for a task the dispatcher is not running.
    #[error("task {0} is not running on this dispatcher")]
    UnknownTask(TaskId),
    /// No runtime is available to execute the task.
    #[error("dispatcher runtime unavailable: {0}")]
    Runtime(String),
}

/// Receives terminal outcomes reported by workers.
pub trait CompletionSink: Send + Sync {
    /// Called once per dispatched task with its final (or ON_HOLD) status.
    fn on_result(&self, task: Task);
}

/// Hands tasks to workers.
pub trait Dispatcher: Send + Sync + 'static {
    /// Send `task` to `task.machine`; the outcome arrives through `sink`.
    ///
    /// # Errors
    ///
    /// The task could not be handed over; the scheduler fails it.
    fn execute(&self, task: Task, sink: Arc<dyn CompletionSink>) -> Result<(), DispatchError>;

    /// Best-effort stop request for a running task.
    ///
    /// # Errors
    ///
    /// The request could not be delivered.
    fn kill_task(&self, task: &Task) -> Result<(), DispatchError>;
}

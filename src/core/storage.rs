//! Storage façade consumed by the scheduler.
//!
//! Every call is blocking and independent; the scheduler never relies on
//! atomicity across calls. Retry policy lives in the façade implementation
//! (see [`crate::infra::storage::RetryingStorage`]), not in the scheduler.

use thiserror::Error;

use crate::core::flow::FlowStatus;
use crate::core::machines::Machine;
use crate::core::task::{FlowId, MachineId, Task, TaskId, TaskStatus};

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No task with this id.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    /// No task belongs to this flow.
    #[error("flow {0} not found")]
    FlowNotFound(FlowId),
    /// No machine with this id.
    #[error("machine {0} not found")]
    MachineNotFound(MachineId),
    /// `start_flow` found no CREATED task.
    #[error("flow {0} has no tasks to start")]
    NoTasksToStart(FlowId),
    /// A context replacement with no tasks.
    #[error("cannot replace task {0} with an empty task list")]
    EmptyReplacement(TaskId),
    /// Backend temporarily unreachable; safe to retry.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Persistent store of tasks, flows and machines.
pub trait Storage: Send + Sync {
    /// Tasks currently in status NEW, oldest first.
    fn get_new_tasks(&self) -> Result<Vec<Task>, StorageError>;

    /// Every task of `flow_id`, ordered by stage then id.
    fn get_tasks(&self, flow_id: FlowId) -> Result<Vec<Task>, StorageError>;

    /// A single task.
    fn get_task(&self, task_id: TaskId) -> Result<Task, StorageError>;

    /// Persist `task.status` (and its machine, when set) through the status
    /// guard and return the status actually stored.
    fn update_task_status(&self, task: &Task) -> Result<TaskStatus, StorageError>;

    /// Batch variant of [`Storage::update_task_status`].
    fn update_tasks_status(&self, tasks: &[Task]) -> Result<(), StorageError>;

    /// Move the CREATED tasks of a flow to NEW.
    fn start_flow(&self, flow_id: FlowId) -> Result<(), StorageError>;

    /// Move a resumable task back to NEW.
    fn resume_task(&self, task_id: TaskId) -> Result<(), StorageError>;

    /// Cancel a task that is not running. Returns `false` when the task is
    /// PROCESSING and must be killed instead.
    fn cancel_task(&self, task: &Task) -> Result<bool, StorageError>;

    /// Cancel every idle task of a flow; returns the tasks still running.
    fn cancel_flow(&self, flow_id: FlowId) -> Result<Vec<Task>, StorageError>;

    /// Replace a wildcard template with its concrete tasks, returning them
    /// with their assigned ids.
    fn insert_context_to_task(&self, original: &Task, replacements: Vec<Task>) -> Result<Vec<Task>, StorageError>;

    /// Known machines; the server entry only when `include_server`.
    fn get_all_machines(&self, include_server: bool) -> Result<Vec<Machine>, StorageError>;

    /// Replace the stored machine snapshot.
    fn save_machines(&self, machines: &[Machine]) -> Result<(), StorageError>;

    /// Insert or update one machine.
    fn update_machine(&self, machine: &Machine) -> Result<(), StorageError>;

    /// Flip a machine's administrative flag.
    fn change_machine_activity(&self, machine_id: MachineId, active: bool) -> Result<(), StorageError>;

    /// Persist `tasks` as a new flow in status CREATED.
    fn create_flow(&self, tasks: Vec<Task>) -> Result<FlowId, StorageError>;

    /// Every task currently PROCESSING.
    fn get_processing_tasks(&self) -> Result<Vec<Task>, StorageError>;

    /// Aggregate status of a flow.
    fn flow_status(&self, flow_id: FlowId) -> Result<FlowStatus, StorageError> {
        let tasks = self.get_tasks(flow_id)?;
        Ok(FlowStatus::derive(tasks.iter().map(|t| t.status)))
    }
}

//! Retry-wrapped storage façade.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::core::machines::Machine;
use crate::core::storage::{Storage, StorageError};
use crate::core::task::{FlowId, MachineId, Task, TaskId, TaskStatus};

/// Wraps a backend and retries recoverable failures with a fixed delay.
pub struct RetryingStorage<S> {
    inner: S,
    max_attempts: u32,
    delay: Duration,
}

impl<S: Storage> RetryingStorage<S> {
    /// Wrap `inner`, making at most `max_attempts` attempts per call.
    pub fn new(inner: S, max_attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// The wrapped backend.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    fn retry<T>(
        &self,
        op: &'static str,
        mut call: impl FnMut(&S) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut attempt = 1;
        loop {
            match call(&self.inner) {
                Err(e) if e.is_recoverable() && attempt < self.max_attempts => {
                    warn!(op, attempt, error = %e, "storage call failed, retrying");
                    attempt += 1;
                    thread::sleep(self.delay);
                }
                other => return other,
            }
        }
    }
}

impl<S: Storage> Storage for RetryingStorage<S> {
    fn get_new_tasks(&self) -> Result<Vec<Task>, StorageError> {
        self.retry("get_new_tasks", S::get_new_tasks)
    }

    fn get_tasks(&self, flow_id: FlowId) -> Result<Vec<Task>, StorageError> {
        self.retry("get_tasks", |s| s.get_tasks(flow_id))
    }

    fn get_task(&self, task_id: TaskId) -> Result<Task, StorageError> {
        self.retry("get_task", |s| s.get_task(task_id))
    }

    fn update_task_status(&self, task: &Task) -> Result<TaskStatus, StorageError> {
        self.retry("update_task_status", |s| s.update_task_status(task))
    }

    fn update_tasks_status(&self, tasks: &[Task]) -> Result<(), StorageError> {
        self.retry("update_tasks_status", |s| s.update_tasks_status(tasks))
    }

    fn start_flow(&self, flow_id: FlowId) -> Result<(), StorageError> {
        self.retry("start_flow", |s| s.start_flow(flow_id))
    }

    fn resume_task(&self, task_id: TaskId) -> Result<(), StorageError> {
        self.retry("resume_task", |s| s.resume_task(task_id))
    }

    fn cancel_task(&self, task: &Task) -> Result<bool, StorageError> {
        self.retry("cancel_task", |s| s.cancel_task(task))
    }

    fn cancel_flow(&self, flow_id: FlowId) -> Result<Vec<Task>, StorageError> {
        self.retry("cancel_flow", |s| s.cancel_flow(flow_id))
    }

    fn insert_context_to_task(
        &self,
        original: &Task,
        replacements: Vec<Task>,
    ) -> Result<Vec<Task>, StorageError> {
        self.retry("insert_context_to_task", |s| {
            s.insert_context_to_task(original, replacements.clone())
        })
    }

    fn get_all_machines(&self, include_server: bool) -> Result<Vec<Machine>, StorageError> {
        self.retry("get_all_machines", |s| s.get_all_machines(include_server))
    }

    fn save_machines(&self, machines: &[Machine]) -> Result<(), StorageError> {
        self.retry("save_machines", |s| s.save_machines(machines))
    }

    fn update_machine(&self, machine: &Machine) -> Result<(), StorageError> {
        self.retry("update_machine", |s| s.update_machine(machine))
    }

    fn change_machine_activity(&self, machine_id: MachineId, active: bool) -> Result<(), StorageError> {
        self.retry("change_machine_activity", |s| {
            s.change_machine_activity(machine_id, active)
        })
    }

    fn create_flow(&self, tasks: Vec<Task>) -> Result<FlowId, StorageError> {
        self.retry("create_flow", |s| s.create_flow(tasks.clone()))
    }

    fn get_processing_tasks(&self) -> Result<Vec<Task>, StorageError> {
        self.retry("get_processing_tasks", S::get_processing_tasks)
    }
}

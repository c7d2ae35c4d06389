//! In-memory storage backend for development and testing.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::machines::{Machine, SERVER_MACHINE_ID};
use crate::core::storage::{Storage, StorageError};
use crate::core::task::{FlowId, MachineId, StatusUpdate, Task, TaskId, TaskStatus};

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    tasks: BTreeMap<TaskId, Task>,
    machines: BTreeMap<MachineId, Machine>,
    next_task_id: TaskId,
    next_flow_id: FlowId,
    #[serde(skip)]
    failures_left: u32,
}

impl State {
    fn check_failure(&mut self) -> Result<(), StorageError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(StorageError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn allocate_task_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        self.next_task_id
    }

    fn apply_status(&mut self, task: &Task) -> Result<TaskStatus, StorageError> {
        let stored = self
            .tasks
            .get_mut(&task.id)
            .ok_or(StorageError::TaskNotFound(task.id))?;
        match stored.status.update_to(task.status) {
            StatusUpdate::Apply(status) => {
                stored.status = status;
                if task.machine.is_some() {
                    stored.machine.clone_from(&task.machine);
                }
            }
            StatusUpdate::Deny => {
                warn!(
                    task_id = task.id,
                    current = %stored.status,
                    requested = %task.status,
                    "denied status transition from final status"
                );
            }
            StatusUpdate::KeepProcessing => {
                debug!(task_id = task.id, "ignoring PENDING request for a running task");
            }
        }
        Ok(stored.status)
    }

    fn flow_tasks(&self, flow_id: FlowId) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.flow_id == flow_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.stage, t.id));
        tasks
    }
}

/// Thread-safe in-memory [`Storage`].
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
}

impl InMemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with [`StorageError::Unavailable`].
    pub fn inject_failures(&self, count: u32) {
        self.state.lock().failures_left = count;
    }

    /// Overwrite a task's status, bypassing the status guard.
    ///
    /// # Errors
    ///
    /// [`StorageError::TaskNotFound`] for an unknown id.
    pub fn force_status(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StorageError::TaskNotFound(task_id))?;
        task.status = status;
        Ok(())
    }

    /// Serialize the whole store to JSON.
    ///
    /// # Errors
    ///
    /// Serialization failures.
    pub fn to_json_string(&self) -> Result<String, StorageError> {
        serde_json::to_string(&*self.state.lock())
            .map_err(|e| StorageError::Backend(format!("snapshot encode: {e}")))
    }

    /// Rebuild a store from [`InMemoryStorage::to_json_string`] output.
    ///
    /// # Errors
    ///
    /// Malformed input.
    pub fn from_json_str(input: &str) -> Result<Self, StorageError> {
        let state: State = serde_json::from_str(input)
            .map_err(|e| StorageError::Backend(format!("snapshot decode: {e}")))?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }
}

impl Storage for InMemoryStorage {
    fn get_new_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::New)
            .cloned()
            .collect())
    }

    fn get_tasks(&self, flow_id: FlowId) -> Result<Vec<Task>, StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        Ok(state.flow_tasks(flow_id))
    }

    fn get_task(&self, task_id: TaskId) -> Result<Task, StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(StorageError::TaskNotFound(task_id))
    }

    fn update_task_status(&self, task: &Task) -> Result<TaskStatus, StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        state.apply_status(task)
    }

    fn update_tasks_status(&self, tasks: &[Task]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        for task in tasks {
            state.apply_status(task)?;
        }
        Ok(())
    }

    fn start_flow(&self, flow_id: FlowId) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        let mut found = false;
        let mut started = 0usize;
        for task in state.tasks.values_mut().filter(|t| t.flow_id == flow_id) {
            found = true;
            if task.status == TaskStatus::Created {
                task.status = TaskStatus::New;
                started += 1;
            }
        }
        if !found {
            return Err(StorageError::FlowNotFound(flow_id));
        }
        if started == 0 {
            return Err(StorageError::NoTasksToStart(flow_id));
        }
        debug!(flow_id, started, "flow started");
        Ok(())
    }

    fn resume_task(&self, task_id: TaskId) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StorageError::TaskNotFound(task_id))?;
        if task.status.is_resumable() {
            task.status = TaskStatus::New;
            task.machine = None;
        } else {
            debug!(task_id, status = %task.status, "task is not resumable");
        }
        Ok(())
    }

    fn cancel_task(&self, task: &Task) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        let stored = state
            .tasks
            .get_mut(&task.id)
            .ok_or(StorageError::TaskNotFound(task.id))?;
        match stored.status {
            TaskStatus::Processing => Ok(false),
            status if status.is_final() => Ok(true),
            _ => {
                stored.status = TaskStatus::Canceled;
                Ok(true)
            }
        }
    }

    fn cancel_flow(&self, flow_id: FlowId) -> Result<Vec<Task>, StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        let mut found = false;
        let mut running = Vec::new();
        for task in state.tasks.values_mut().filter(|t| t.flow_id == flow_id) {
            found = true;
            match task.status {
                TaskStatus::Processing => running.push(task.clone()),
                status if status.is_final() => {}
                _ => task.status = TaskStatus::Canceled,
            }
        }
        if !found {
            return Err(StorageError::FlowNotFound(flow_id));
        }
        Ok(running)
    }

    fn insert_context_to_task(
        &self,
        original: &Task,
        replacements: Vec<Task>,
    ) -> Result<Vec<Task>, StorageError> {
        if replacements.is_empty() {
            return Err(StorageError::EmptyReplacement(original.id));
        }
        let mut state = self.state.lock();
        state.check_failure()?;
        if state.tasks.remove(&original.id).is_none() {
            return Err(StorageError::TaskNotFound(original.id));
        }
        let mut inserted = Vec::with_capacity(replacements.len());
        for mut task in replacements {
            task.id = state.allocate_task_id();
            task.flow_id = original.flow_id;
            task.stage = original.stage;
            task.status = TaskStatus::New;
            task.machine = None;
            state.tasks.insert(task.id, task.clone());
            inserted.push(task);
        }
        Ok(inserted)
    }

    fn get_all_machines(&self, include_server: bool) -> Result<Vec<Machine>, StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        Ok(state
            .machines
            .values()
            .filter(|m| include_server || m.id != SERVER_MACHINE_ID)
            .cloned()
            .collect())
    }

    fn save_machines(&self, machines: &[Machine]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        state.machines = machines.iter().map(|m| (m.id, m.clone())).collect();
        Ok(())
    }

    fn update_machine(&self, machine: &Machine) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        state.machines.insert(machine.id, machine.clone());
        Ok(())
    }

    fn change_machine_activity(&self, machine_id: MachineId, active: bool) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        let machine = state
            .machines
            .get_mut(&machine_id)
            .ok_or(StorageError::MachineNotFound(machine_id))?;
        machine.active = active;
        Ok(())
    }

    fn create_flow(&self, tasks: Vec<Task>) -> Result<FlowId, StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        state.next_flow_id += 1;
        let flow_id = state.next_flow_id;
        for mut task in tasks {
            task.id = state.allocate_task_id();
            task.flow_id = flow_id;
            task.status = TaskStatus::Created;
            state.tasks.insert(task.id, task);
        }
        Ok(flow_id)
    }

    fn get_processing_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let mut state = self.state.lock();
        state.check_failure()?;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow::FlowStatus;
    use crate::core::task::{Context, UnitTemplate};

    fn flow(storage: &InMemoryStorage, stages: &[u32]) -> FlowId {
        let tasks = stages
            .iter()
            .map(|&stage| Task::new(stage, UnitTemplate::default(), Context::default()))
            .collect();
        storage.create_flow(tasks).unwrap()
    }

    #[test]
    fn test_start_flow_moves_created_to_new() {
        let storage = InMemoryStorage::new();
        let flow_id = flow(&storage, &[0, 1]);
        storage.start_flow(flow_id).unwrap();
        assert_eq!(storage.get_new_tasks().unwrap().len(), 2);
        assert!(matches!(
            storage.start_flow(flow_id),
            Err(StorageError::NoTasksToStart(_))
        ));
        assert!(matches!(storage.start_flow(99), Err(StorageError::FlowNotFound(99))));
    }

    #[test]
    fn test_status_guard() {
        let storage = InMemoryStorage::new();
        let flow_id = flow(&storage, &[0]);
        let task = storage.get_tasks(flow_id).unwrap().remove(0);

        let running = task.with_status(TaskStatus::Processing);
        assert_eq!(storage.update_task_status(&running).unwrap(), TaskStatus::Processing);
        let pending = task.with_status(TaskStatus::Pending);
        assert_eq!(storage.update_task_status(&pending).unwrap(), TaskStatus::Processing);
        let failed = task.with_status(TaskStatus::Failed);
        assert_eq!(storage.update_task_status(&failed).unwrap(), TaskStatus::Failed);
        let late = task.with_status(TaskStatus::Completed);
        assert_eq!(storage.update_task_status(&late).unwrap(), TaskStatus::Failed);
    }

    #[test]
    fn test_cancel_semantics() {
        let storage = InMemoryStorage::new();
        let flow_id = flow(&storage, &[0, 0, 1]);
        let tasks = storage.get_tasks(flow_id).unwrap();
        storage.force_status(tasks[0].id, TaskStatus::Processing).unwrap();
        storage.force_status(tasks[1].id, TaskStatus::Completed).unwrap();

        assert!(!storage.cancel_task(&tasks[0]).unwrap());
        assert!(storage.cancel_task(&tasks[1]).unwrap());
        assert_eq!(storage.get_task(tasks[1].id).unwrap().status, TaskStatus::Completed);

        let running = storage.cancel_flow(flow_id).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, tasks[0].id);
        assert_eq!(storage.get_task(tasks[2].id).unwrap().status, TaskStatus::Canceled);
        assert_eq!(storage.flow_status(flow_id).unwrap(), FlowStatus::Canceled);
    }

    #[test]
    fn test_insert_context_replaces_template() {
        let storage = InMemoryStorage::new();
        let flow_id = flow(&storage, &[1]);
        let template = storage.get_tasks(flow_id).unwrap().remove(0);
        assert!(matches!(
            storage.insert_context_to_task(&template, vec![]),
            Err(StorageError::EmptyReplacement(_))
        ));
        let copies = vec![template.clone(), template.clone()];
        let inserted = storage.insert_context_to_task(&template, copies).unwrap();
        assert_eq!(inserted.len(), 2);
        assert!(inserted.iter().all(|t| t.flow_id == flow_id && t.status == TaskStatus::New));
        assert!(storage.get_task(template.id).is_err());
    }

    #[test]
    fn test_injected_failures_are_recoverable() {
        let storage = InMemoryStorage::new();
        storage.inject_failures(1);
        let err = storage.get_new_tasks().unwrap_err();
        assert!(err.is_recoverable());
        assert!(storage.get_new_tasks().is_ok());
    }

    #[test]
    fn test_snapshot_restores_tasks() {
        let storage = InMemoryStorage::new();
        let flow_id = flow(&storage, &[0, 1]);
        let restored = InMemoryStorage::from_json_str(&storage.to_json_string().unwrap()).unwrap();
        assert_eq!(restored.get_tasks(flow_id).unwrap().len(), 2);
        assert_eq!(restored.create_flow(vec![]).unwrap(), flow_id + 1);
    }
}

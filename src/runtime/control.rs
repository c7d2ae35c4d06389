//! Caller-side control surface: cancellation, kill and flow requests.
//!
//! Every cancellation follows the same protocol against the scheduler:
//! mark the task in-cancel, cancel it in storage (or kill it when it is
//! already running), then clear the mark whatever the outcome.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::dispatcher::{DispatchError, Dispatcher};
use crate::core::queue_manager::QueueManager;
use crate::core::storage::Storage;
use crate::core::task::{FlowId, MachineId, Task, TaskId, TaskStatus};
use crate::core::SchedulerError;

/// What a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestAction {
    /// Cancel one task; kill it if it is running.
    CancelTask,
    /// Ask the worker holding a task to stop it.
    KillTask,
    /// Move a stopped, failed or held task back to NEW.
    ResumeTask,
    /// Start a created flow.
    RunFlow,
    /// Cancel every task of a flow.
    CancelFlow,
    /// Enable a machine.
    ActivateMachine,
    /// Disable a machine.
    DeactivateMachine,
}

impl fmt::Display for RequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CancelTask => "CANCEL_TASK",
            Self::KillTask => "KILL_TASK",
            Self::ResumeTask => "RESUME_TASK",
            Self::RunFlow => "RUN_FLOW",
            Self::CancelFlow => "CANCEL_FLOW",
            Self::ActivateMachine => "ACTIVATE_MACHINE",
            Self::DeactivateMachine => "DEACTIVATE_MACHINE",
        };
        f.write_str(name)
    }
}

/// A control request. `entity_id` is a task, flow or machine id depending
/// on `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Request identifier.
    pub request_id: u64,
    /// Target of the action.
    pub entity_id: u64,
    /// Requested action.
    pub action: RequestAction,
}

impl ExecutionRequest {
    /// Build a request.
    #[must_use]
    pub const fn new(request_id: u64, entity_id: u64, action: RequestAction) -> Self {
        Self {
            request_id,
            entity_id,
            action,
        }
    }
}

/// Outcome of [`Controller::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// The action was carried out.
    Completed,
    /// The action failed; details were logged.
    Failed,
}

/// Executes control requests against a running scheduler.
pub struct Controller<S: Storage + 'static, D: Dispatcher> {
    scheduler: Arc<QueueManager<S, D>>,
}

impl<S: Storage + 'static, D: Dispatcher> Clone for Controller<S, D> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

impl<S: Storage + 'static, D: Dispatcher> Controller<S, D> {
    /// Control `scheduler`.
    pub const fn new(scheduler: Arc<QueueManager<S, D>>) -> Self {
        Self { scheduler }
    }

    /// The controlled scheduler.
    pub const fn scheduler(&self) -> &Arc<QueueManager<S, D>> {
        &self.scheduler
    }

    /// Execute `request`, logging any failure.
    pub fn handle(&self, request: &ExecutionRequest) -> RequestStatus {
        let id = request.entity_id;
        let result = match request.action {
            RequestAction::CancelTask => self.cancel_task(id),
            RequestAction::KillTask => self.kill_task(id),
            RequestAction::ResumeTask => self.resume_task(id),
            RequestAction::RunFlow => self.run_flow(id),
            RequestAction::CancelFlow => self.cancel_flow(id),
            RequestAction::ActivateMachine => self.set_machine_active(id, true),
            RequestAction::DeactivateMachine => self.set_machine_active(id, false),
        };
        match result {
            Ok(()) => RequestStatus::Completed,
            Err(e) => {
                error!(
                    request_id = request.request_id,
                    action = %request.action,
                    error = %e,
                    "failed to handle request"
                );
                RequestStatus::Failed
            }
        }
    }

    /// Start a created flow.
    ///
    /// # Errors
    ///
    /// Storage failures, including a flow with nothing to start.
    pub fn run_flow(&self, flow_id: FlowId) -> Result<(), SchedulerError> {
        self.scheduler.start_flow(flow_id)
    }

    /// Move a task back to NEW.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn resume_task(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        self.scheduler.resume_task(task_id)
    }

    /// Cancel one task, killing it if it is already running.
    ///
    /// A task cancelled in storage also goes through completion handling so
    /// the next stage is held instead of waiting forever.
    ///
    /// # Errors
    ///
    /// Storage failures. The in-cancel mark is cleared either way.
    pub fn cancel_task(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        let task = self.scheduler.storage().get_task(task_id)?;
        self.scheduler.about_to_cancel(&task);
        let result = self.cancel_marked(&task);
        self.scheduler.cancel_completed(&task);
        result
    }

    fn cancel_marked(&self, task: &Task) -> Result<(), SchedulerError> {
        let storage = self.scheduler.storage();
        if !storage.cancel_task(task)? {
            self.kill(task);
            return Ok(());
        }
        let stored = storage.get_task(task.id)?;
        if stored.status == TaskStatus::Canceled {
            info!(task_id = task.id, "task canceled");
            self.scheduler.update_task_after_execution(stored);
        }
        Ok(())
    }

    /// Cancel every task of a flow; running tasks are killed.
    ///
    /// Tasks cancelled in storage go through completion handling like
    /// [`Controller::cancel_task`], releasing any dependency group they block.
    ///
    /// # Errors
    ///
    /// Storage failures. In-cancel marks are cleared either way.
    pub fn cancel_flow(&self, flow_id: FlowId) -> Result<(), SchedulerError> {
        let storage = self.scheduler.storage();
        let tasks = storage.get_tasks(flow_id)?;
        for task in &tasks {
            self.scheduler.about_to_cancel(task);
        }
        let result = self.cancel_flow_marked(flow_id, &tasks);
        for task in &tasks {
            self.scheduler.cancel_completed(task);
        }
        result
    }

    fn cancel_flow_marked(&self, flow_id: FlowId, tasks: &[Task]) -> Result<(), SchedulerError> {
        let storage = self.scheduler.storage();
        let running = storage.cancel_flow(flow_id)?;
        info!(flow_id, running = running.len(), "flow canceled");
        for task in &running {
            self.kill(task);
        }
        for task in tasks.iter().filter(|t| {
            matches!(t.status, TaskStatus::New | TaskStatus::Pending | TaskStatus::OnHold)
        }) {
            let stored = storage.get_task(task.id)?;
            if stored.status == TaskStatus::Canceled {
                self.scheduler.update_task_after_execution(stored);
            }
        }
        Ok(())
    }

    /// Ask the worker holding a task to stop it.
    ///
    /// # Errors
    ///
    /// Storage failures while loading the task.
    pub fn kill_task(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        let task = self.scheduler.storage().get_task(task_id)?;
        self.kill(&task);
        Ok(())
    }

    /// Enable or disable a machine and refresh the registry.
    ///
    /// # Errors
    ///
    /// Storage failures, including an unknown machine.
    pub fn set_machine_active(&self, machine_id: MachineId, active: bool) -> Result<(), SchedulerError> {
        let storage = self.scheduler.storage();
        storage.change_machine_activity(machine_id, active)?;
        self.scheduler
            .machines()
            .set_machines(storage.get_all_machines(false)?);
        info!(machine_id, active, "machine activity changed");
        Ok(())
    }

    /// Send a kill for `task`. When its machine is gone, or the dispatcher
    /// does not know the task, nothing will ever report back, so the task is
    /// failed through the completion path.
    pub(crate) fn kill(&self, task: &Task) {
        let Some(machine) = task.machine.as_ref() else {
            warn!(task_id = task.id, "tried to stop task with no machine");
            return;
        };
        let orphaned = match self.scheduler.dispatcher().kill_task(task) {
            Ok(()) => false,
            Err(DispatchError::UnknownTask(_)) => true,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "kill request failed");
                false
            }
        };
        let unavailable = !matches!(self.scheduler.machines().is_available(machine.id), Ok(true));
        if orphaned || unavailable {
            info!(
                task_id = task.id,
                machine_id = machine.id,
                "stop request sent but the task has no live worker; failing it"
            );
            self.scheduler
                .update_task_after_execution(task.with_status(TaskStatus::Failed));
        } else {
            info!(task_id = task.id, machine_id = machine.id, "stop request sent");
        }
    }
}

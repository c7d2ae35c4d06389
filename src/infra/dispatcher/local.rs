//! In-process dispatcher running tasks on a tokio runtime.
//!
//! Useful for single-host deployments and tests: every task is handed to a
//! [`TaskRunner`] on the runtime, and its outcome is reported back through
//! the completion sink from the blocking pool, since the scheduler side of
//! the sink takes blocking locks and talks to storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::core::dispatcher::{CompletionSink, DispatchError, Dispatcher};
use crate::core::task::{Task, TaskId, TaskStatus};

/// Executes one task.
///
/// `Ok` reports COMPLETED, `Err` reports FAILED.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    /// Run `task` to completion.
    async fn run(&self, task: Task) -> anyhow::Result<()>;
}

struct Running {
    task: Task,
    sink: Arc<dyn CompletionSink>,
    abort: AbortHandle,
}

type RunningMap = Arc<Mutex<HashMap<TaskId, Running>>>;

/// Dispatcher that executes tasks in this process.
///
/// No worker announces heartbeats for the machines a local deployment
/// configures, so build their registry with
/// [`MachinesManager::with_local_heartbeats`](crate::core::MachinesManager::with_local_heartbeats)
/// (`local_machine_heartbeats` in the configuration). Otherwise they go stale
/// after a few heartbeat intervals and every task is held.
pub struct LocalDispatcher<R: TaskRunner> {
    handle: Handle,
    runtime: Option<Runtime>,
    runner: Arc<R>,
    running: RunningMap,
}

impl<R: TaskRunner> LocalDispatcher<R> {
    /// Run tasks on an existing runtime.
    pub fn new(runner: R, handle: Handle) -> Self {
        Self {
            handle,
            runtime: None,
            runner: Arc::new(runner),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run tasks on a dedicated multi-threaded runtime owned by the dispatcher.
    ///
    /// # Errors
    ///
    /// The runtime could not be built.
    pub fn with_worker_threads(runner: R, worker_threads: usize) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("fs-dispatch")
            .enable_all()
            .build()?;
        let mut dispatcher = Self::new(runner, runtime.handle().clone());
        dispatcher.runtime = Some(runtime);
        Ok(dispatcher)
    }

    /// Ids of the tasks currently running, ascending.
    pub fn running_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.running.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The task runner.
    pub fn runner(&self) -> &R {
        &self.runner
    }
}

impl<R: TaskRunner> Dispatcher for LocalDispatcher<R> {
    fn execute(&self, task: Task, sink: Arc<dyn CompletionSink>) -> Result<(), DispatchError> {
        let task_id = task.id;
        let runner = Arc::clone(&self.runner);
        let running = Arc::clone(&self.running);

        // Held across the spawn so the run cannot finish before it is tracked.
        let mut tracked = self.running.lock();
        if tracked.contains_key(&task_id) {
            return Err(DispatchError::Send {
                task_id,
                reason: "task is already running".into(),
            });
        }
        let job = task.clone();
        let join = self.handle.spawn(async move {
            let outcome = match runner.run(job).await {
                Ok(()) => TaskStatus::Completed,
                Err(e) => {
                    warn!(task_id, error = %e, "task run failed");
                    TaskStatus::Failed
                }
            };
            let removed = { running.lock().remove(&task_id) };
            let Some(entry) = removed else {
                return;
            };
            let reported = entry.task.with_status(outcome);
            if tokio::task::spawn_blocking(move || entry.sink.on_result(reported))
                .await
                .is_err()
            {
                warn!(task_id, "completion report panicked");
            }
        });
        tracked.insert(
            task_id,
            Running {
                task,
                sink,
                abort: join.abort_handle(),
            },
        );
        debug!(task_id, "task started locally");
        Ok(())
    }

    fn kill_task(&self, task: &Task) -> Result<(), DispatchError> {
        let entry = self
            .running
            .lock()
            .remove(&task.id)
            .ok_or(DispatchError::UnknownTask(task.id))?;
        entry.abort.abort();
        debug!(task_id = task.id, "task aborted");
        let stopped = entry.task.with_status(TaskStatus::Stopped);
        let sink = entry.sink;
        drop(self.handle.spawn_blocking(move || sink.on_result(stopped)));
        Ok(())
    }
}

impl<R: TaskRunner> Drop for LocalDispatcher<R> {
    fn drop(&mut self) {
        for (_, entry) in self.running.lock().drain() {
            entry.abort.abort();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

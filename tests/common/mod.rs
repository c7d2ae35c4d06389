//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus_flow_scheduler::config::SchedulerConfig;
use prometheus_flow_scheduler::core::{
    AuditSink, CompletionSink, Context, DispatchError, Dispatcher, FlowId, FlowStatus, Machine, MachineId,
    MachinesManager, QueueManager, Storage, Task, TaskId, TaskStatus, UnitTemplate,
};
use prometheus_flow_scheduler::infra::InMemoryStorage;
use prometheus_flow_scheduler::util::{init_tracing, now_ms};

// ============================================================================
// TEST DISPATCHER
// ============================================================================

/// Dispatcher that records every call.
///
/// In auto mode each dispatched task reports its outcome from a helper
/// thread; in manual mode the test reports through [`RecordingDispatcher::report`].
#[derive(Default)]
pub struct RecordingDispatcher {
    auto: bool,
    delay: Duration,
    outcomes: Mutex<HashMap<TaskId, TaskStatus>>,
    executed: Mutex<Vec<Task>>,
    running: Mutex<HashMap<TaskId, (Task, Arc<dyn CompletionSink>)>>,
    killed: Mutex<Vec<TaskId>>,
    fail_sends: AtomicBool,
}

impl RecordingDispatcher {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn auto_complete() -> Self {
        Self {
            auto: true,
            ..Self::default()
        }
    }

    pub fn auto_complete_after(delay: Duration) -> Self {
        Self {
            auto: true,
            delay,
            ..Self::default()
        }
    }

    /// Report `status` instead of COMPLETED for `task_id` in auto mode.
    pub fn set_outcome(&self, task_id: TaskId, status: TaskStatus) {
        self.outcomes.lock().insert(task_id, status);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<Task> {
        self.executed.lock().clone()
    }

    pub fn executed_ids(&self) -> Vec<TaskId> {
        self.executed.lock().iter().map(|t| t.id).collect()
    }

    pub fn killed(&self) -> Vec<TaskId> {
        self.killed.lock().clone()
    }

    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.running.lock().contains_key(&task_id)
    }

    /// Report the outcome of a running task through the scheduler's sink.
    pub fn report(&self, task_id: TaskId, status: TaskStatus) -> bool {
        let entry = self.running.lock().remove(&task_id);
        match entry {
            Some((task, sink)) => {
                sink.on_result(task.with_status(status));
                true
            }
            None => false,
        }
    }
}

impl Dispatcher for RecordingDispatcher {
    fn execute(&self, task: Task, sink: Arc<dyn CompletionSink>) -> Result<(), DispatchError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DispatchError::Send {
                task_id: task.id,
                reason: "connection refused".into(),
            });
        }
        self.executed.lock().push(task.clone());
        if self.auto {
            let outcome = self
                .outcomes
                .lock()
                .get(&task.id)
                .copied()
                .unwrap_or(TaskStatus::Completed);
            let delay = self.delay;
            thread::spawn(move || {
                thread::sleep(delay);
                sink.on_result(task.with_status(outcome));
            });
        } else {
            self.running.lock().insert(task.id, (task, sink));
        }
        Ok(())
    }

    fn kill_task(&self, task: &Task) -> Result<(), DispatchError> {
        self.killed.lock().push(task.id);
        if self.auto || self.running.lock().contains_key(&task.id) {
            Ok(())
        } else {
            Err(DispatchError::UnknownTask(task.id))
        }
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub type TestScheduler = QueueManager<InMemoryStorage, RecordingDispatcher>;

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        consumer_threads: 3,
        queue_capacity: 16,
        producer_idle_timeout_secs: 1,
        storage_retry_delay_ms: 10,
        storage_max_attempts: 3,
        shutdown_timeout_secs: 5,
        heartbeat_interval_secs: 60,
        machines: Vec::new(),
        local_machine_heartbeats: false,
    }
}

pub fn worker(id: MachineId) -> Machine {
    Machine {
        id,
        address: format!("10.0.0.{id}"),
        description: format!("worker-{id}"),
        active: true,
        connected: true,
        last_heartbeat_ms: now_ms(),
    }
}

pub fn unit(name: &str) -> UnitTemplate {
    UnitTemplate {
        id: 1,
        name: name.into(),
        executable: format!("{name}.sh"),
        input_paths: "/data/in".into(),
        output_dir: "/data/out".into(),
        parameters: vec![],
    }
}

pub fn plain_task(stage: u32) -> Task {
    Task::new(stage, unit(&format!("stage{stage}")), Context::default())
}

/// Persist a flow with `sizes[n]` tasks in stage `n`.
pub fn create_flow(storage: &InMemoryStorage, sizes: &[usize]) -> FlowId {
    let tasks = sizes
        .iter()
        .enumerate()
        .flat_map(|(stage, &count)| {
            (0..count).map(move |_| plain_task(u32::try_from(stage).unwrap()))
        })
        .collect();
    storage.create_flow(tasks).unwrap()
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// HARNESS
// ============================================================================

/// A scheduler over in-memory storage and a recording dispatcher.
pub struct Harness {
    pub storage: Arc<InMemoryStorage>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub scheduler: Arc<TestScheduler>,
}

impl Harness {
    pub fn new(dispatcher: RecordingDispatcher) -> Self {
        Self::with_machines(dispatcher, vec![worker(1), worker(2)])
    }

    pub fn with_machines(dispatcher: RecordingDispatcher, machines: Vec<Machine>) -> Self {
        Self::build(dispatcher, machines, None)
    }

    pub fn with_audit(dispatcher: RecordingDispatcher, audit: Arc<dyn AuditSink>) -> Self {
        Self::build(dispatcher, vec![worker(1), worker(2)], Some(audit))
    }

    fn build(
        dispatcher: RecordingDispatcher,
        machines: Vec<Machine>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        init_tracing();
        let storage = Arc::new(InMemoryStorage::new());
        let dispatcher = Arc::new(dispatcher);
        let config = test_config();
        let registry = Arc::new(MachinesManager::new(
            Arc::clone(&storage),
            machines,
            config.heartbeat_interval(),
        ));
        let mut scheduler = QueueManager::new(
            config,
            Arc::clone(&storage),
            Arc::clone(&dispatcher),
            registry,
        );
        if let Some(audit) = audit {
            scheduler = scheduler.with_audit(audit);
        }
        let scheduler = Arc::new(scheduler);
        Self {
            storage,
            dispatcher,
            scheduler,
        }
    }

    pub fn start(&self) {
        self.scheduler.machines().start().unwrap();
        self.scheduler.start().unwrap();
    }

    pub fn tasks(&self, flow_id: FlowId) -> Vec<Task> {
        self.storage.get_tasks(flow_id).unwrap()
    }

    pub fn stage_ids(&self, flow_id: FlowId, stage: u32) -> Vec<TaskId> {
        self.tasks(flow_id)
            .into_iter()
            .filter(|t| t.stage == stage)
            .map(|t| t.id)
            .collect()
    }

    pub fn status(&self, task_id: TaskId) -> TaskStatus {
        self.storage.get_task(task_id).unwrap().status
    }

    pub fn flow_status(&self, flow_id: FlowId) -> FlowStatus {
        self.storage.flow_status(flow_id).unwrap()
    }

    pub fn wait_status(&self, task_id: TaskId, status: TaskStatus) -> bool {
        wait_until(WAIT, || self.status(task_id) == status)
    }

    pub fn wait_flow(&self, flow_id: FlowId, status: FlowStatus) -> bool {
        wait_until(WAIT, || self.flow_status(flow_id) == status)
    }

    pub fn wait_running(&self, task_id: TaskId) -> bool {
        wait_until(WAIT, || self.dispatcher.is_running(task_id))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.scheduler.machines().stop();
    }
}

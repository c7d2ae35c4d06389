//! Producer/consumer scheduling engine.
//!
//! One producer thread polls storage for NEW tasks, expands wildcard
//! templates, holds tasks whose predecessor stage is stuck and enqueues the
//! rest as PENDING. A fixed pool of consumers pops tasks, checks stage
//! readiness against the [`DependencyIndex`], picks a machine and dispatches.
//! Completion notices re-enter through [`QueueManager::update_task_after_execution`]
//! and release or hold the next stage.
//!
//! # Coordination
//!
//! - Producer gate: paused while `start_flow`/`resume_task` write to storage,
//!   idle while storage has nothing new (bounded by the idle timeout).
//! - Consumer gate: raised by the producer around "enqueue + PENDING write"
//!   so consumers never act on a task whose PENDING status has not landed.
//! - Dependency index: single writer with explicit hand-off ([`HandOff`]).
//! - In-cancel set: a task id in it is never dispatched.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::core::audit::{build_audit_event, AuditAction, AuditSink};
use crate::core::context;
use crate::core::dependency::{BlockingSet, DependencyIndex, StageKey};
use crate::core::dispatcher::{CompletionSink, Dispatcher};
use crate::core::machines::MachinesManager;
use crate::core::storage::{Storage, StorageError};
use crate::core::task::{FlowId, Task, TaskId, TaskStatus};
use crate::core::SchedulerError;
use crate::handoff::HandOff;
use crate::infra::queue::memory::QueueSignal;
use crate::infra::queue::BoundedTaskQueue;

/// Receives conditions the scheduler cannot repair locally.
///
/// The expected reaction is an orderly stop-and-restart of the scheduling
/// subsystem, performed off the calling thread.
pub trait FatalHandler: Send + Sync {
    /// Called once per fatal error.
    fn on_fatal(&self, error: &SchedulerError);
}

/// Default handler: logs and leaves recovery to the operator.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFatalHandler;

impl FatalHandler for LogFatalHandler {
    fn on_fatal(&self, error: &SchedulerError) {
        error!(error = %error, "fatal scheduler error; no restart handler installed");
    }
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Producer and consumers are running.
    pub running: bool,
    /// Size of the consumer pool.
    pub consumer_threads: usize,
    /// Tasks waiting in the in-memory queue.
    pub queued: usize,
    /// Tasks enqueued and marked PENDING.
    pub enqueued: u64,
    /// Tasks handed to the dispatcher.
    pub dispatched: u64,
    /// Tasks moved to ON_HOLD.
    pub held: u64,
    /// Dependents released back to NEW.
    pub released: u64,
    /// Wildcard templates expanded.
    pub expanded: u64,
    /// Terminal outcomes persisted.
    pub completed: u64,
    /// Open dependency groups (0 while the index is busy).
    pub open_dependency_groups: usize,
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    held: AtomicU64,
    released: AtomicU64,
    expanded: AtomicU64,
    completed: AtomicU64,
}

impl SchedulerCounters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct ProducerGate {
    /// Outstanding `start_flow`/`resume_task` writes.
    paused: u32,
    /// Last poll found nothing.
    idle: bool,
    shutdown: bool,
    /// Bumped by every wake so a wake racing an empty poll is not lost.
    wakes: u64,
}

struct Shared<S: Storage + 'static, D: Dispatcher> {
    storage: Arc<S>,
    dispatcher: Arc<D>,
    machines: Arc<MachinesManager<S>>,
    producer: Mutex<ProducerGate>,
    producer_cv: Condvar,
    producer_updating: Mutex<bool>,
    consumer_cv: Condvar,
    index: HandOff<DependencyIndex>,
    in_cancel: Mutex<HashSet<TaskId>>,
    counters: SchedulerCounters,
    audit: RwLock<Option<Arc<dyn AuditSink>>>,
    fatal: RwLock<Arc<dyn FatalHandler>>,
    idle_timeout: Duration,
    retry_delay: Duration,
}

/// What the producer did with one polled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Produced {
    Handled,
    Skipped,
    Shutdown,
}

struct RunState {
    shutdown_tx: Sender<()>,
    queue: BoundedTaskQueue,
    workers: Vec<(String, JoinHandle<()>)>,
}

/// The scheduler.
pub struct QueueManager<S: Storage + 'static, D: Dispatcher> {
    config: SchedulerConfig,
    shared: Arc<Shared<S, D>>,
    run: Mutex<Option<RunState>>,
}

impl<S: Storage + 'static, D: Dispatcher> QueueManager<S, D> {
    /// Create a stopped scheduler.
    pub fn new(
        config: SchedulerConfig,
        storage: Arc<S>,
        dispatcher: Arc<D>,
        machines: Arc<MachinesManager<S>>,
    ) -> Self {
        let shared = Shared {
            storage,
            dispatcher,
            machines,
            producer: Mutex::new(ProducerGate::default()),
            producer_cv: Condvar::new(),
            producer_updating: Mutex::new(false),
            consumer_cv: Condvar::new(),
            index: HandOff::default(),
            in_cancel: Mutex::new(HashSet::new()),
            counters: SchedulerCounters::default(),
            audit: RwLock::new(None),
            fatal: RwLock::new(Arc::new(LogFatalHandler)),
            idle_timeout: config.producer_idle_timeout(),
            retry_delay: config.storage_retry_delay(),
        };
        Self {
            config,
            shared: Arc::new(shared),
            run: Mutex::new(None),
        }
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(self, audit: Arc<dyn AuditSink>) -> Self {
        *self.shared.audit.write() = Some(audit);
        self
    }

    /// Replace the fatal-condition handler.
    pub fn set_fatal_handler(&self, handler: Arc<dyn FatalHandler>) {
        *self.shared.fatal.write() = handler;
    }

    /// Storage used by the scheduler.
    pub fn storage(&self) -> &Arc<S> {
        &self.shared.storage
    }

    /// Dispatcher used by the scheduler.
    pub fn dispatcher(&self) -> &Arc<D> {
        &self.shared.dispatcher
    }

    /// Machine registry used by the scheduler.
    pub fn machines(&self) -> &Arc<MachinesManager<S>> {
        &self.shared.machines
    }

    /// Configuration the scheduler was built with.
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether producer and consumers are running.
    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }

    /// Launch the producer and the consumer pool.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::AlreadyRunning`] unless stopped, or a thread spawn
    /// failure.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut run = self.run.lock();
        if run.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        info!(
            consumers = self.config.consumer_threads,
            queue_capacity = self.config.queue_capacity,
            "starting queue manager"
        );
        {
            let mut gate = self.shared.producer.lock();
            gate.shutdown = false;
            gate.idle = false;
        }
        *self.shared.producer_updating.lock() = false;

        let queue = BoundedTaskQueue::new(self.config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut workers = Vec::with_capacity(self.config.consumer_threads + 1);

        let spawned = self.spawn_workers(&queue, &shutdown_rx, &mut workers);
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn scheduler threads");
            self.shared.producer.lock().shutdown = true;
            self.shared.producer_cv.notify_all();
            drop(shutdown_tx);
            return Err(SchedulerError::Spawn(e));
        }

        *run = Some(RunState {
            shutdown_tx,
            queue,
            workers,
        });
        Ok(())
    }

    fn spawn_workers(
        &self,
        queue: &BoundedTaskQueue,
        shutdown_rx: &Receiver<()>,
        workers: &mut Vec<(String, JoinHandle<()>)>,
    ) -> std::io::Result<()> {
        let name = "fs-producer".to_owned();
        let (shared, q, rx) = (Arc::clone(&self.shared), queue.clone(), shutdown_rx.clone());
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_producer(&shared, &q, &rx))?;
        workers.push((name, handle));

        for consumer_id in 0..self.config.consumer_threads {
            let name = format!("fs-consumer-{consumer_id}");
            let (shared, q, rx) = (Arc::clone(&self.shared), queue.clone(), shutdown_rx.clone());
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_consumer(&shared, consumer_id, &q, &rx))?;
            workers.push((name, handle));
        }
        Ok(())
    }

    /// Halt producer and consumers.
    ///
    /// Waits at most the configured shutdown timeout for the threads. Queued
    /// tasks and registered dependents are returned to NEW so the next start
    /// rediscovers them; the dependency index is discarded.
    pub fn stop(&self) {
        let Some(run) = self.run.lock().take() else {
            return;
        };
        info!("stopping queue manager");
        {
            let mut gate = self.shared.producer.lock();
            gate.shutdown = true;
        }
        self.shared.producer_cv.notify_all();
        *self.shared.producer_updating.lock() = false;
        self.shared.consumer_cv.notify_all();
        drop(run.shutdown_tx);

        let deadline = Instant::now() + self.config.shutdown_timeout();
        let current = thread::current().id();
        let mut unterminated = 0usize;
        for (name, handle) in run.workers {
            if handle.thread().id() == current {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !join_within(handle, remaining) {
                warn!(thread = %name, "scheduler thread did not exit within timeout - detaching");
                unterminated += 1;
            }
        }
        if unterminated > 0 {
            error!(unterminated, "consumer pool did not terminate");
        }

        let mut orphans: Vec<Task> = run
            .queue
            .drain()
            .into_iter()
            .map(|task| task.with_status(TaskStatus::New))
            .collect();
        {
            let mut index = self.shared.index.acquire();
            orphans.extend(
                index
                    .drain_dependents()
                    .into_iter()
                    .map(|task| task.with_status(TaskStatus::New)),
            );
        }
        if !orphans.is_empty() {
            if let Err(e) = self.shared.storage.update_tasks_status(&orphans) {
                warn!(error = %e, count = orphans.len(), "failed to return queued tasks to NEW");
            }
        }
        info!("queue manager stopped");
    }

    /// Move a flow's CREATED tasks to NEW and wake the producer.
    ///
    /// # Errors
    ///
    /// The storage error from the write.
    pub fn start_flow(&self, flow_id: FlowId) -> Result<(), SchedulerError> {
        self.shared.pause_producer();
        let result = self.shared.storage.start_flow(flow_id);
        self.shared.resume_producer();
        result?;
        info!(flow_id, "flow started");
        Ok(())
    }

    /// Move a resumable task back to NEW and wake the producer.
    ///
    /// # Errors
    ///
    /// The storage error from the write.
    pub fn resume_task(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        self.shared.pause_producer();
        let result = self.shared.storage.resume_task(task_id);
        self.shared.resume_producer();
        result?;
        info!(task_id, "task resumed");
        Ok(())
    }

    /// Persist a terminal (or ON_HOLD) outcome and resolve dependents.
    ///
    /// Storage failures here are fatal and go to the fatal handler.
    pub fn update_task_after_execution(&self, task: Task) {
        self.shared.on_result(task);
    }

    /// Mark `task` as being cancelled; it will not be dispatched.
    pub fn about_to_cancel(&self, task: &Task) {
        self.shared.in_cancel.lock().insert(task.id);
    }

    /// Clear the in-cancel mark of `task`.
    pub fn cancel_completed(&self, task: &Task) {
        self.shared.in_cancel.lock().remove(&task.id);
        self.shared.wake_producer();
    }

    /// Whether `task_id` is marked in-cancel.
    pub fn is_in_cancel(&self, task_id: TaskId) -> bool {
        self.shared.in_cancel.lock().contains(&task_id)
    }

    /// Current statistics.
    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.shared.counters;
        let run = self.run.lock();
        SchedulerStats {
            running: run.is_some(),
            consumer_threads: self.config.consumer_threads,
            queued: run.as_ref().map_or(0, |r| r.queue.len()),
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            held: counters.held.load(Ordering::Relaxed),
            released: counters.released.load(Ordering::Relaxed),
            expanded: counters.expanded.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            open_dependency_groups: self.shared.index.try_acquire().map_or(0, |index| index.len()),
        }
    }
}

impl<S: Storage + 'static, D: Dispatcher> Drop for QueueManager<S, D> {
    fn drop(&mut self) {
        if self.run.get_mut().is_some() {
            debug!("QueueManager dropped while running - stopping");
            self.stop();
        }
    }
}

impl<S: Storage + 'static, D: Dispatcher> CompletionSink for Shared<S, D> {
    fn on_result(&self, task: Task) {
        if let Err(e) = self.settle(task) {
            error!(error = %e, "failed to update task after execution");
            self.notify_fatal(e.into());
        }
    }
}

impl<S: Storage + 'static, D: Dispatcher> Shared<S, D> {
    fn notify_fatal(&self, error: SchedulerError) {
        let handler = Arc::clone(&self.fatal.read());
        handler.on_fatal(&error);
    }

    fn record(&self, task: &Task, action: AuditAction, payload: Option<String>) {
        if let Some(audit) = self.audit.read().as_ref() {
            audit.record(build_audit_event(task.id, task.flow_id, action, payload));
        }
    }

    // --- producer gate ---

    fn pause_producer(&self) {
        self.producer.lock().paused += 1;
    }

    fn resume_producer(&self) {
        {
            let mut gate = self.producer.lock();
            gate.paused = gate.paused.saturating_sub(1);
        }
        self.wake_producer();
    }

    fn wake_producer(&self) {
        let mut gate = self.producer.lock();
        gate.wakes = gate.wakes.wrapping_add(1);
        gate.idle = false;
        drop(gate);
        self.producer_cv.notify_all();
    }

    /// Block until the producer may poll; `None` on shutdown.
    fn wait_for_turn(&self) -> Option<u64> {
        let mut gate = self.producer.lock();
        loop {
            if gate.shutdown {
                return None;
            }
            if gate.paused == 0 && !gate.idle {
                return Some(gate.wakes);
            }
            let timed_out = self
                .producer_cv
                .wait_for(&mut gate, self.idle_timeout)
                .timed_out();
            if timed_out && gate.idle {
                gate.idle = false;
            }
        }
    }

    fn mark_idle(&self, seen_wakes: u64) {
        let mut gate = self.producer.lock();
        if gate.wakes == seen_wakes {
            gate.idle = true;
        }
    }

    fn backoff(&self) {
        let mut gate = self.producer.lock();
        if !gate.shutdown {
            self.producer_cv.wait_for(&mut gate, self.retry_delay);
        }
    }

    // --- consumer gate ---

    fn set_producer_updating(&self, updating: bool) {
        *self.producer_updating.lock() = updating;
        if !updating {
            self.consumer_cv.notify_all();
        }
    }

    fn wait_for_producer(&self) {
        let mut updating = self.producer_updating.lock();
        while *updating {
            self.consumer_cv.wait(&mut updating);
        }
    }

    // --- producer ---

    /// Handle one NEW task.
    fn produce(
        &self,
        task: Task,
        queue: &BoundedTaskQueue,
        shutdown: &Receiver<()>,
    ) -> Result<Produced, SchedulerError> {
        if self.in_cancel.lock().contains(&task.id) {
            debug!(task_id = task.id, "skipping task pending cancellation");
            return Ok(Produced::Skipped);
        }
        if task.needs_expansion() {
            self.expand_template(&task)?;
            return Ok(Produced::Handled);
        }
        if self.predecessor_stuck(&task)? {
            info!(task_id = task.id, flow_id = task.flow_id, "predecessor stage is stuck; holding task");
            self.record(&task, AuditAction::Hold, Some("predecessor stuck".into()));
            self.settle(task.with_status(TaskStatus::OnHold))?;
            return Ok(Produced::Handled);
        }

        debug!(task_id = task.id, "adding task to queue");
        let pending = task.with_status(TaskStatus::Pending);
        self.set_producer_updating(true);
        if let Err(pending) = queue.offer(pending.clone()) {
            self.set_producer_updating(false);
            if queue.put(pending, shutdown) == QueueSignal::Shutdown {
                return Ok(Produced::Shutdown);
            }
            self.set_producer_updating(true);
        }
        let written = {
            let in_cancel = self.in_cancel.lock();
            if in_cancel.contains(&pending.id) {
                Ok(None)
            } else {
                self.storage.update_task_status(&pending).map(Some)
            }
        };
        self.set_producer_updating(false);
        if written?.is_some() {
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            self.record(&pending, AuditAction::Enqueue, None);
        }
        Ok(Produced::Handled)
    }

    fn expand_template(&self, template: &Task) -> Result<(), SchedulerError> {
        let concrete = match context::expand(template) {
            Ok(concrete) => concrete,
            Err(e) => {
                warn!(task_id = template.id, error = %e, "context expansion failed; failing task");
                self.settle(template.with_status(TaskStatus::Failed))?;
                return Ok(());
            }
        };
        let inserted = self.storage.insert_context_to_task(template, concrete)?;
        let ids: Vec<TaskId> = inserted.iter().map(|t| t.id).collect();
        self.index
            .acquire()
            .substitute(StageKey::of(template), template.id, &ids);
        self.counters.expanded.fetch_add(1, Ordering::Relaxed);
        self.record(template, AuditAction::Expand, Some(format!("{ids:?}")));
        info!(task_id = template.id, count = ids.len(), "expanded wildcard task");
        Ok(())
    }

    fn predecessor_stuck(&self, task: &Task) -> Result<bool, StorageError> {
        let Some(key) = StageKey::predecessor_of(task) else {
            return Ok(false);
        };
        Ok(self
            .storage
            .get_tasks(task.flow_id)?
            .iter()
            .any(|t| t.stage == key.stage && t.status.is_failure()))
    }

    // --- consumer ---

    fn consume(self: &Arc<Self>, task: Task) -> Result<(), SchedulerError> {
        if !self.ready_for_execute(&task)? {
            debug!(task_id = task.id, "task waits on its predecessor stage");
            return Ok(());
        }
        if task.has_unresolved_output() {
            warn!(task_id = task.id, output = %task.output_path(), "unresolved output path; failing task");
            self.settle(task.with_status(TaskStatus::Failed))?;
            return Ok(());
        }
        let machine = match self.machines.get_available_machine() {
            Ok(machine) => machine,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "no machine for task; holding it");
                self.record(&task, AuditAction::Hold, Some(e.to_string()));
                self.settle(task.with_status(TaskStatus::OnHold))?;
                return Ok(());
            }
        };

        let mut running = task.with_status(TaskStatus::Processing);
        running.machine = Some(machine);
        let stored = {
            let in_cancel = self.in_cancel.lock();
            if in_cancel.contains(&running.id) {
                debug!(task_id = running.id, "task pending cancellation; not dispatching");
                return Ok(());
            }
            self.storage.update_task_status(&running)?
        };
        if stored != TaskStatus::Processing {
            debug!(task_id = running.id, status = %stored, "task settled before dispatch");
            if stored.triggers_resolution() {
                let mut index = self.index.acquire();
                self.resolve(&mut index, &running.with_status(stored), true)?;
            }
            return Ok(());
        }

        debug!(task_id = running.id, "sending task for execution");
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.record(&running, AuditAction::Dispatch, running.machine.as_ref().map(|m| m.address.clone()));
        let sink: Arc<dyn CompletionSink> = Arc::clone(self) as Arc<dyn CompletionSink>;
        if let Err(e) = self.dispatcher.execute(running.clone(), sink) {
            warn!(task_id = running.id, error = %e, "dispatch failed; failing task");
            self.settle(running.with_status(TaskStatus::Failed))?;
        }
        Ok(())
    }

    fn ready_for_execute(&self, task: &Task) -> Result<bool, StorageError> {
        let Some(key) = StageKey::predecessor_of(task) else {
            return Ok(true);
        };
        let mut index = self.index.acquire();
        let blockers: BlockingSet = self
            .storage
            .get_tasks(task.flow_id)?
            .iter()
            .filter(|t| t.stage == key.stage && t.status != TaskStatus::Completed)
            .map(|t| t.id)
            .collect();
        if blockers.is_empty() {
            return Ok(true);
        }
        index.register(key, blockers, task.clone());

        // A blocker may have settled between the read above and the registration.
        let settled: Vec<Task> = self
            .storage
            .get_tasks(task.flow_id)?
            .into_iter()
            .filter(|t| t.stage == key.stage && t.status.triggers_resolution())
            .collect();
        for sibling in &settled {
            if !index.contains(&key) {
                break;
            }
            self.resolve(&mut index, sibling, true)?;
        }
        Ok(false)
    }

    // --- completion ---

    /// Persist `task.status`, then resolve dependents if the stored status
    /// settles the task. Returns the stored status.
    fn settle(&self, task: Task) -> Result<TaskStatus, StorageError> {
        let stored = self.storage.update_task_status(&task)?;
        if stored.is_final() {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            self.record(&task, AuditAction::Complete, Some(stored.to_string()));
        } else if stored == TaskStatus::OnHold {
            self.counters.held.fetch_add(1, Ordering::Relaxed);
        }
        if stored.triggers_resolution() {
            let settled = task.with_status(stored);
            let mut index = self.index.acquire();
            self.resolve(&mut index, &settled, true)?;
        }
        Ok(stored)
    }

    fn resolve(&self, index: &mut DependencyIndex, task: &Task, top_level: bool) -> Result<(), StorageError> {
        let Some(resolution) = index.complete(StageKey::of(task), task.id, task.status) else {
            return Ok(());
        };
        self.storage.update_tasks_status(&resolution.dependents)?;
        let count = resolution.dependents.len();
        if resolution.status == TaskStatus::New {
            info!(flow_id = task.flow_id, stage = task.stage, count, "stage cleared; releasing dependents");
            SchedulerCounters::add(&self.counters.released, count);
            for dependent in &resolution.dependents {
                self.record(dependent, AuditAction::Release, None);
            }
        } else {
            info!(
                flow_id = task.flow_id,
                stage = task.stage,
                count,
                trigger = %task.status,
                "stage stuck; holding dependents"
            );
            SchedulerCounters::add(&self.counters.held, count);
            for dependent in &resolution.dependents {
                self.record(dependent, AuditAction::Hold, Some(format!("stage {} stuck", task.stage)));
                self.resolve(index, dependent, false)?;
            }
        }
        if top_level {
            self.wake_producer();
        }
        Ok(())
    }
}

fn run_producer<S: Storage + 'static, D: Dispatcher>(
    shared: &Arc<Shared<S, D>>,
    queue: &BoundedTaskQueue,
    shutdown: &Receiver<()>,
) {
    debug!("producer thread started");
    while let Some(wakes) = shared.wait_for_turn() {
        let tasks = match shared.storage.get_new_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to poll new tasks; retrying next cycle");
                shared.backoff();
                continue;
            }
        };
        let mut handled = 0usize;
        for task in tasks {
            match shared.produce(task, queue, shutdown) {
                Ok(Produced::Handled) => handled += 1,
                Ok(Produced::Skipped) => {}
                Ok(Produced::Shutdown) => {
                    debug!("producer observed shutdown while enqueueing");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "queue producer failed");
                    shared.notify_fatal(e);
                    return;
                }
            }
        }
        // Nothing new, or only tasks pending cancellation: wait for a wake.
        if handled == 0 {
            shared.mark_idle(wakes);
        }
    }
    debug!("producer thread exiting");
}

fn run_consumer<S: Storage + 'static, D: Dispatcher>(
    shared: &Arc<Shared<S, D>>,
    consumer_id: usize,
    queue: &BoundedTaskQueue,
    shutdown: &Receiver<()>,
) {
    debug!(consumer_id, "consumer thread started");
    loop {
        let QueueSignal::Done(task) = queue.take(shutdown) else {
            break;
        };
        if matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected)) {
            if let Err(e) = shared.storage.update_task_status(&task.with_status(TaskStatus::New)) {
                warn!(task_id = task.id, error = %e, "failed to return task to NEW on shutdown");
            }
            break;
        }
        shared.wait_for_producer();
        if let Err(e) = shared.consume(task) {
            error!(consumer_id, error = %e, "queue consumer failed");
            shared.notify_fatal(e);
            break;
        }
    }
    debug!(consumer_id, "consumer thread exiting");
}

/// Join `handle`, giving up after `timeout`.
fn join_within(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let (tx, rx) = bounded(1);
    let joiner = thread::spawn(move || {
        let _ = tx.send(handle.join().is_ok());
    });
    match rx.recv_timeout(timeout) {
        Ok(clean) => {
            if !clean {
                warn!("scheduler thread panicked");
            }
            let _ = joiner.join();
            true
        }
        Err(_) => false,
    }
}

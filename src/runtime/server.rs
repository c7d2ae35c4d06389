//! Execution server: owns the scheduler lifecycle.
//!
//! `start` brings up the machine registry, fails over tasks a previous run
//! left PROCESSING and starts the scheduler. A fatal scheduler error triggers
//! an orderly stop-and-restart on the `fs-supervisor` thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::core::dispatcher::Dispatcher;
use crate::core::queue_manager::{FatalHandler, QueueManager};
use crate::core::storage::Storage;
use crate::core::SchedulerError;
use crate::runtime::control::Controller;

/// Forwards fatal errors to the supervisor; duplicates while a restart is
/// pending are dropped.
struct RestartOnFatal {
    tx: Sender<()>,
}

impl FatalHandler for RestartOnFatal {
    fn on_fatal(&self, error: &SchedulerError) {
        info!(error = %error, "fatal error occurred; restarting scheduler");
        let _ = self.tx.try_send(());
    }
}

struct Inner<S: Storage + 'static, D: Dispatcher> {
    controller: Controller<S, D>,
    restarts: AtomicU64,
}

impl<S: Storage + 'static, D: Dispatcher> Inner<S, D> {
    fn scheduler(&self) -> &Arc<QueueManager<S, D>> {
        self.controller.scheduler()
    }

    fn bring_up(&self) -> Result<(), SchedulerError> {
        let scheduler = self.scheduler();
        scheduler.machines().start()?;
        info!("performing cleanup of tasks left processing");
        let processing = scheduler.storage().get_processing_tasks()?;
        scheduler.start()?;
        for task in &processing {
            self.controller.kill(task);
        }
        Ok(())
    }

    fn bring_down(&self) {
        let scheduler = self.scheduler();
        scheduler.stop();
        scheduler.machines().stop();
    }

    fn supervise(&self, fatal_rx: &Receiver<()>, stop_rx: &Receiver<()>, retry_delay: Duration) {
        loop {
            select! {
                recv(fatal_rx) -> msg => {
                    if msg.is_err() {
                        return;
                    }
                }
                recv(stop_rx) -> _ => return,
            }
            self.bring_down();
            self.restarts.fetch_add(1, Ordering::Relaxed);
            loop {
                match self.bring_up() {
                    Ok(()) => {
                        info!("scheduler restarted");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "failed to restart scheduler");
                        self.bring_down();
                        select! {
                            recv(stop_rx) -> _ => return,
                            default(retry_delay) => {}
                        }
                    }
                }
            }
        }
    }
}

struct Supervisor {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Wires storage, machines, scheduler and dispatcher into one service.
pub struct ExecutionServer<S: Storage + 'static, D: Dispatcher> {
    inner: Arc<Inner<S, D>>,
    fatal_rx: Receiver<()>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl<S: Storage + 'static, D: Dispatcher> ExecutionServer<S, D> {
    /// Serve `scheduler`. Installs the restart-on-fatal handler.
    pub fn new(scheduler: Arc<QueueManager<S, D>>) -> Self {
        let (fatal_tx, fatal_rx) = bounded(1);
        scheduler.set_fatal_handler(Arc::new(RestartOnFatal { tx: fatal_tx }));
        Self {
            inner: Arc::new(Inner {
                controller: Controller::new(scheduler),
                restarts: AtomicU64::new(0),
            }),
            fatal_rx,
            supervisor: Mutex::new(None),
        }
    }

    /// The request surface.
    pub fn controller(&self) -> &Controller<S, D> {
        &self.inner.controller
    }

    /// The served scheduler.
    pub fn scheduler(&self) -> &Arc<QueueManager<S, D>> {
        self.inner.scheduler()
    }

    /// Restarts performed after fatal errors.
    pub fn restarts(&self) -> u64 {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    /// Start the registry and the scheduler, after killing every task a
    /// previous run left PROCESSING.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::AlreadyRunning`], or the failure that prevented the
    /// start; nothing is left running in that case.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        info!("starting execution server");
        while self.fatal_rx.try_recv().is_ok() {}
        if let Err(e) = self.inner.bring_up() {
            error!(error = %e, "execution server failed to start");
            self.inner.bring_down();
            return Err(e);
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        let fatal_rx = self.fatal_rx.clone();
        let retry_delay = self.scheduler().config().storage_retry_delay();
        let spawned = thread::Builder::new()
            .name("fs-supervisor".into())
            .spawn(move || inner.supervise(&fatal_rx, &stop_rx, retry_delay));
        match spawned {
            Ok(handle) => {
                *supervisor = Some(Supervisor { stop_tx, handle });
                Ok(())
            }
            Err(e) => {
                self.inner.bring_down();
                Err(SchedulerError::Spawn(e))
            }
        }
    }

    /// Stop the supervisor, the scheduler and the registry.
    pub fn stop(&self) {
        let Some(supervisor) = self.supervisor.lock().take() else {
            return;
        };
        info!("execution server is shutting down");
        drop(supervisor.stop_tx);
        if supervisor.handle.join().is_err() {
            warn!("supervisor thread panicked");
        }
        self.inner.bring_down();
    }
}

impl<S: Storage + 'static, D: Dispatcher> Drop for ExecutionServer<S, D> {
    fn drop(&mut self) {
        self.stop();
    }
}

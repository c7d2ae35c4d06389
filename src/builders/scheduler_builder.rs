//! Build a scheduler from configuration.

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::core::dispatcher::Dispatcher;
use crate::core::machines::{Machine, MachinesManager};
use crate::core::queue_manager::QueueManager;
use crate::core::storage::Storage;
use crate::core::SchedulerError;
use crate::runtime::ExecutionServer;

/// Validate `cfg`, build the machine registry from it and return a stopped
/// [`QueueManager`].
///
/// # Errors
///
/// [`SchedulerError::InvalidConfig`] when validation fails.
pub fn build_scheduler<S, D>(
    cfg: SchedulerConfig,
    storage: Arc<S>,
    dispatcher: Arc<D>,
) -> Result<QueueManager<S, D>, SchedulerError>
where
    S: Storage + 'static,
    D: Dispatcher,
{
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;
    let machines: Vec<Machine> = cfg.machines.iter().map(Machine::from).collect();
    let mut registry = MachinesManager::new(Arc::clone(&storage), machines, cfg.heartbeat_interval());
    if cfg.local_machine_heartbeats {
        registry = registry.with_local_heartbeats();
    }
    Ok(QueueManager::new(cfg, storage, dispatcher, Arc::new(registry)))
}

/// [`build_scheduler`] wrapped in a stopped [`ExecutionServer`].
///
/// # Errors
///
/// As [`build_scheduler`].
pub fn build_server<S, D>(
    cfg: SchedulerConfig,
    storage: Arc<S>,
    dispatcher: Arc<D>,
) -> Result<ExecutionServer<S, D>, SchedulerError>
where
    S: Storage + 'static,
    D: Dispatcher,
{
    let scheduler = build_scheduler(cfg, storage, dispatcher)?;
    Ok(ExecutionServer::new(Arc::new(scheduler)))
}

//! Machine registry and worker selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::MachineConfig;
use crate::core::storage::{Storage, StorageError};
use crate::core::task::MachineId;
use crate::util::clock::now_ms;

/// Id reserved for the scheduler's own host entry.
pub const SERVER_MACHINE_ID: MachineId = 0;

/// Heartbeats older than this many intervals mark a machine stale.
pub const STALE_AFTER_INTERVALS: u32 = 5;

/// A worker machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Machine identifier.
    pub id: MachineId,
    /// Network address.
    pub address: String,
    /// Free-form description.
    pub description: String,
    /// Administratively enabled.
    pub active: bool,
    /// Currently reachable.
    pub connected: bool,
    /// Last heartbeat, milliseconds since the epoch.
    pub last_heartbeat_ms: u128,
}

impl Machine {
    /// The synthetic entry that stands for the scheduler host.
    #[must_use]
    pub fn server() -> Self {
        Self {
            id: SERVER_MACHINE_ID,
            address: "<server>".into(),
            description: "server".into(),
            active: true,
            connected: true,
            last_heartbeat_ms: now_ms(),
        }
    }

    /// Whether this machine may receive work at `now_ms` given `stale_after`.
    #[must_use]
    pub fn is_live(&self, now_ms: u128, stale_after: Duration) -> bool {
        self.active
            && self.connected
            && now_ms.saturating_sub(self.last_heartbeat_ms) < stale_after.as_millis()
    }
}

impl From<&MachineConfig> for Machine {
    fn from(cfg: &MachineConfig) -> Self {
        Self {
            id: cfg.id,
            address: cfg.address.clone(),
            description: cfg.description.clone(),
            active: cfg.active,
            connected: cfg.active,
            last_heartbeat_ms: now_ms(),
        }
    }
}

/// Errors produced by the machine registry.
#[derive(Debug, Error)]
pub enum MachineError {
    /// No machine passed the liveness filter.
    #[error("no available machines")]
    NoAvailableMachines,
    /// Refreshing from storage failed.
    #[error("machine storage error: {0}")]
    Storage(#[from] StorageError),
    /// The heartbeat thread could not be spawned.
    #[error("failed to spawn heartbeat thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Heartbeat {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// In-process view of the worker pool.
pub struct MachinesManager<S: Storage> {
    storage: Arc<S>,
    configured: RwLock<Vec<Machine>>,
    machines: RwLock<Vec<Machine>>,
    counter: AtomicUsize,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<Heartbeat>>,
    local_heartbeats: bool,
}

impl<S: Storage + 'static> MachinesManager<S> {
    /// Create a registry for `machines`, announcing liveness every
    /// `heartbeat_interval`.
    pub fn new(storage: Arc<S>, machines: Vec<Machine>, heartbeat_interval: Duration) -> Self {
        Self {
            storage,
            configured: RwLock::new(machines),
            machines: RwLock::new(Vec::new()),
            counter: AtomicUsize::new(0),
            heartbeat_interval,
            heartbeat: Mutex::new(None),
            local_heartbeats: false,
        }
    }

    /// Also refresh the configured machines' heartbeats from the heartbeat
    /// thread.
    ///
    /// Remote workers announce themselves; machines that stand for local
    /// executors have nobody to do it, and without this they go stale after
    /// [`STALE_AFTER_INTERVALS`] intervals and every task is held.
    #[must_use]
    pub fn with_local_heartbeats(mut self) -> Self {
        self.local_heartbeats = true;
        self
    }

    /// Register the server entry and every configured machine, replacing the
    /// stored snapshot, and start the heartbeat thread.
    ///
    /// # Errors
    ///
    /// Storage failures while saving the snapshot.
    pub fn start(&self) -> Result<(), MachineError> {
        let mut snapshot = vec![Machine::server()];
        snapshot.extend(self.configured.read().iter().cloned());
        self.storage.save_machines(&snapshot)?;
        *self.machines.write() = snapshot.into_iter().skip(1).collect();

        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.is_none() {
            let local = if self.local_heartbeats {
                self.configured.read().iter().map(|m| m.id).collect()
            } else {
                Vec::new()
            };
            *heartbeat = Some(spawn_heartbeat(
                Arc::clone(&self.storage),
                self.heartbeat_interval,
                local,
            )?);
        }
        info!(machines = self.machines.read().len(), "machines manager started");
        Ok(())
    }

    /// Stop the heartbeat thread.
    pub fn stop(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            drop(heartbeat.stop_tx);
            if heartbeat.handle.join().is_err() {
                warn!("heartbeat thread panicked");
            }
            debug!("heartbeat stopped");
        }
    }

    /// Replace the configured machine list; takes effect on the next `start`.
    pub fn set_machines(&self, machines: Vec<Machine>) {
        *self.configured.write() = machines;
    }

    /// Age after which a heartbeat no longer counts.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval * STALE_AFTER_INTERVALS
    }

    /// Pick a live machine by round-robin.
    ///
    /// # Errors
    ///
    /// [`MachineError::NoAvailableMachines`] when nothing is live, or the
    /// storage error from the refresh.
    pub fn get_available_machine(&self) -> Result<Machine, MachineError> {
        let pool = self.refresh()?;
        if pool.is_empty() {
            return Err(MachineError::NoAvailableMachines);
        }
        let turn = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Ok(pool[turn % pool.len()].clone())
    }

    /// Whether `machine_id` is currently live.
    ///
    /// # Errors
    ///
    /// Storage failures during the refresh.
    pub fn is_available(&self, machine_id: MachineId) -> Result<bool, MachineError> {
        Ok(self.refresh()?.iter().any(|m| m.id == machine_id))
    }

    /// Last refreshed machine list (without the server entry).
    #[must_use]
    pub fn machines(&self) -> Vec<Machine> {
        self.machines.read().clone()
    }

    fn refresh(&self) -> Result<Vec<Machine>, MachineError> {
        let all = self.storage.get_all_machines(false)?;
        let now = now_ms();
        let stale_after = self.stale_after();
        let live = all
            .iter()
            .filter(|m| m.is_live(now, stale_after))
            .cloned()
            .collect();
        *self.machines.write() = all;
        Ok(live)
    }
}

impl<S: Storage> Drop for MachinesManager<S> {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            drop(heartbeat.stop_tx);
        }
    }
}

fn spawn_heartbeat<S: Storage + 'static>(
    storage: Arc<S>,
    interval: Duration,
    local: Vec<MachineId>,
) -> std::io::Result<Heartbeat> {
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let handle = thread::Builder::new()
        .name("fs-heartbeat".into())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => beat(storage.as_ref(), &local),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
    Ok(Heartbeat { stop_tx, handle })
}

/// Record the server heartbeat, then the heartbeats of `local` machines.
/// Activity flags are read back from storage so administrative changes stick.
fn beat<S: Storage>(storage: &S, local: &[MachineId]) {
    if let Err(e) = storage.update_machine(&Machine::server()) {
        warn!(error = %e, "failed to record server heartbeat");
    }
    if local.is_empty() {
        return;
    }
    let stored = match storage.get_all_machines(false) {
        Ok(stored) => stored,
        Err(e) => {
            warn!(error = %e, "failed to load machines for heartbeat");
            return;
        }
    };
    for mut machine in stored.into_iter().filter(|m| local.contains(&m.id)) {
        machine.connected = true;
        machine.last_heartbeat_ms = now_ms();
        if let Err(e) = storage.update_machine(&machine) {
            warn!(machine_id = machine.id, error = %e, "failed to record machine heartbeat");
        }
    }
}

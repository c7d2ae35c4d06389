//! Scheduler configuration structures.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::core::machines::SERVER_MACHINE_ID;
use crate::core::task::MachineId;
use crate::core::AppResult;

/// Prefix of the environment variables read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "FLOW_SCHEDULER_";

/// A worker machine known at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Machine identifier; must not be the reserved server id 0.
    pub id: MachineId,
    /// Network address.
    pub address: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Administratively enabled.
    #[serde(default = "default_true")]
    pub active: bool,
}

const fn default_true() -> bool {
    true
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Consumer threads (at least 2).
    pub consumer_threads: usize,
    /// Capacity of the in-memory queue.
    pub queue_capacity: usize,
    /// Longest the producer idles before re-polling storage.
    pub producer_idle_timeout_secs: u64,
    /// Pause between failed storage polls, and between façade retries.
    pub storage_retry_delay_ms: u64,
    /// Attempts per storage call made by the retry façade.
    pub storage_max_attempts: u32,
    /// Bound on the wait for scheduler threads in `stop`.
    pub shutdown_timeout_secs: u64,
    /// Interval of the server heartbeat; machines are stale after five.
    pub heartbeat_interval_secs: u64,
    /// Worker machines.
    pub machines: Vec<MachineConfig>,
    /// Refresh the configured machines' heartbeats from the server. Needed
    /// when they stand for local executors that never announce themselves.
    pub local_machine_heartbeats: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            consumer_threads: num_cpus::get().max(2),
            queue_capacity: 500,
            producer_idle_timeout_secs: 30 * 60,
            storage_retry_delay_ms: 1_000,
            storage_max_attempts: 3,
            shutdown_timeout_secs: 30,
            heartbeat_interval_secs: 60,
            machines: Vec::new(),
            local_machine_heartbeats: false,
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A human readable description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.consumer_threads < 2 {
            return Err("consumer_threads must be at least 2".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".into());
        }
        if self.producer_idle_timeout_secs == 0 {
            return Err("producer_idle_timeout_secs must be greater than 0".into());
        }
        if self.storage_max_attempts == 0 {
            return Err("storage_max_attempts must be greater than 0".into());
        }
        if self.storage_retry_delay_ms == 0 {
            return Err("storage_retry_delay_ms must be greater than 0".into());
        }
        if self.shutdown_timeout_secs == 0 {
            return Err("shutdown_timeout_secs must be greater than 0".into());
        }
        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be greater than 0".into());
        }
        let mut seen = HashSet::new();
        for machine in &self.machines {
            if machine.id == SERVER_MACHINE_ID {
                return Err(format!("machine id {SERVER_MACHINE_ID} is reserved for the server"));
            }
            if !seen.insert(machine.id) {
                return Err(format!("machine id {} is defined twice", machine.id));
            }
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// I/O, parse or validation failure.
    pub fn from_json_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scheduler config {}", path.display()))?;
        Self::from_json_str(&raw)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("loading scheduler config {}", path.display()))
    }

    /// Defaults overridden by `FLOW_SCHEDULER_*` variables, after loading a
    /// `.env` file when one is present.
    ///
    /// # Errors
    ///
    /// A variable that does not parse, or a result that fails validation.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        override_from_env("CONSUMER_THREADS", &mut cfg.consumer_threads)?;
        override_from_env("QUEUE_CAPACITY", &mut cfg.queue_capacity)?;
        override_from_env("PRODUCER_IDLE_TIMEOUT_SECS", &mut cfg.producer_idle_timeout_secs)?;
        override_from_env("STORAGE_RETRY_DELAY_MS", &mut cfg.storage_retry_delay_ms)?;
        override_from_env("STORAGE_MAX_ATTEMPTS", &mut cfg.storage_max_attempts)?;
        override_from_env("SHUTDOWN_TIMEOUT_SECS", &mut cfg.shutdown_timeout_secs)?;
        override_from_env("HEARTBEAT_INTERVAL_SECS", &mut cfg.heartbeat_interval_secs)?;
        override_from_env("LOCAL_MACHINE_HEARTBEATS", &mut cfg.local_machine_heartbeats)?;
        if let Ok(raw) = std::env::var(format!("{ENV_PREFIX}MACHINES")) {
            cfg.machines = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {ENV_PREFIX}MACHINES"))?;
        }
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    /// Producer idle timeout.
    #[must_use]
    pub const fn producer_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.producer_idle_timeout_secs)
    }

    /// Delay between storage retries.
    #[must_use]
    pub const fn storage_retry_delay(&self) -> Duration {
        Duration::from_millis(self.storage_retry_delay_ms)
    }

    /// Bound on the shutdown join.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn override_from_env<T>(name: &str, slot: &mut T) -> AppResult<()>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{ENV_PREFIX}{name}");
    if let Ok(raw) = std::env::var(&key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("parsing {key}={raw}"))?;
    }
    Ok(())
}

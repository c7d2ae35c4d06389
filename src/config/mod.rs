//! Configuration models for the scheduler, its queue and the worker pool.

pub mod scheduler;

pub use scheduler::{MachineConfig, SchedulerConfig};

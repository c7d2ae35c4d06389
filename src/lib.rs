//! # Prometheus Flow Scheduler
//!
//! A stage-gated task flow scheduler for compute pipelines.
//!
//! A *flow* is a set of tasks partitioned into ordered stages. Every task of
//! stage `n + 1` waits until all tasks of stage `n` have completed; a failed,
//! stopped or cancelled task leaves its successors ON_HOLD instead of running
//! them on partial input. Tasks whose input path carries a wildcard are
//! expanded into one concrete task per matching directory before they run.
//!
//! ## Architecture
//!
//! - **Producer**: one thread polls storage for NEW tasks, expands wildcard
//!   templates and enqueues the rest into a bounded FIFO.
//! - **Consumers**: a fixed pool pops tasks, checks stage readiness against
//!   the dependency index, picks a live machine round-robin and dispatches.
//! - **Dependency index**: per `(flow, stage)` groups of blockers and waiting
//!   dependents, mutated by a single writer at a time through [`HandOff`].
//! - **Cancellation**: a task marked in-cancel is never dispatched.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_flow_scheduler::builders::build_server;
//! use prometheus_flow_scheduler::config::SchedulerConfig;
//! use prometheus_flow_scheduler::infra::{InMemoryStorage, RetryingStorage};
//! use prometheus_flow_scheduler::infra::dispatcher::LocalDispatcher;
//!
//! let cfg = SchedulerConfig::from_env()?;
//! let storage = Arc::new(RetryingStorage::new(
//!     InMemoryStorage::new(),
//!     cfg.storage_max_attempts,
//!     cfg.storage_retry_delay(),
//! ));
//! let dispatcher = Arc::new(LocalDispatcher::with_worker_threads(my_runner, 4)?);
//! let server = build_server(cfg, storage, dispatcher)?;
//! server.start()?;
//! server.controller().run_flow(flow_id)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task model, dependency index and the queue manager.
pub mod core;
/// Configuration models and loading.
pub mod config;
/// Builders to construct the scheduler from configuration.
pub mod builders;
/// Infrastructure adapters for queues, storage backends and dispatchers.
pub mod infra;
/// Request handling and the execution server.
pub mod runtime;
/// Shared utilities.
pub mod util;
/// Single-writer hand-off primitive.
pub mod handoff;

pub use handoff::{HandOff, HandOffGuard};

//! Core scheduling model, dependency tracking and the queue manager.

pub mod task;
pub mod flow;
pub mod context;
pub mod dependency;
pub mod storage;
pub mod dispatcher;
pub mod machines;
pub mod queue_manager;
pub mod audit;
pub mod error;

pub use error::{AppResult, SchedulerError};
pub use task::{
    Context, ContextLevel, FlowId, MachineId, StatusUpdate, Task, TaskId, TaskStatus,
    UnitParameter, UnitTemplate, WILDCARD,
};
pub use flow::FlowStatus;
pub use context::ContextError;
pub use dependency::{BlockingSet, DependencyGroup, DependencyIndex, Resolution, StageKey};
pub use storage::{Storage, StorageError};
pub use dispatcher::{CompletionSink, DispatchError, Dispatcher};
pub use machines::{Machine, MachineError, MachinesManager, STALE_AFTER_INTERVALS};
pub use queue_manager::{FatalHandler, LogFatalHandler, QueueManager, SchedulerStats};
pub use audit::{AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, build_audit_event};

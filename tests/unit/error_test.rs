//! Tests for error conversions and messages

use prometheus_flow_scheduler::core::{
    ContextError, DispatchError, MachineError, SchedulerError, StorageError,
};

#[test]
fn test_storage_error_recoverability() {
    assert!(StorageError::Unavailable("timeout".into()).is_recoverable());
    assert!(!StorageError::TaskNotFound(3).is_recoverable());
    assert!(!StorageError::Backend("constraint".into()).is_recoverable());
}

#[test]
fn test_scheduler_error_from_components() {
    let err: SchedulerError = StorageError::TaskNotFound(9).into();
    assert!(matches!(err, SchedulerError::Storage(_)));
    assert_eq!(err.to_string(), "task 9 not found");

    let err: SchedulerError = MachineError::NoAvailableMachines.into();
    assert_eq!(err.to_string(), "no available machines");

    let err: SchedulerError = DispatchError::UnknownTask(4).into();
    assert!(matches!(err, SchedulerError::Dispatch(DispatchError::UnknownTask(4))));
}

#[test]
fn test_machine_error_wraps_storage() {
    let err: MachineError = StorageError::Unavailable("down".into()).into();
    assert!(err.to_string().contains("storage unavailable: down"));
}

#[test]
fn test_context_error_is_scheduler_error() {
    let err: SchedulerError = ContextError::NoMatches {
        pattern: "/data/{subject}/in".into(),
    }
    .into();
    assert_eq!(err.to_string(), "pattern /data/{subject}/in matched no directories");
    assert!(matches!(err, SchedulerError::Context(_)));
}

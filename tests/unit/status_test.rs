//! Tests for task and flow status handling through the storage layer

use prometheus_flow_scheduler::core::{
    Context, FlowStatus, Storage, StorageError, Task, TaskStatus, UnitTemplate,
};
use prometheus_flow_scheduler::infra::InMemoryStorage;

fn one_task_flow(storage: &InMemoryStorage) -> Task {
    let unit = UnitTemplate {
        id: 1,
        name: "align".into(),
        executable: "align.sh".into(),
        input_paths: "/data/in".into(),
        output_dir: "/data/out".into(),
        parameters: vec![],
    };
    let flow = storage
        .create_flow(vec![Task::new(0, unit, Context::default())])
        .unwrap();
    storage.get_tasks(flow).unwrap().remove(0)
}

#[test]
fn test_storage_returns_persisted_status() {
    let storage = InMemoryStorage::new();
    let task = one_task_flow(&storage);

    let running = task.with_status(TaskStatus::Processing);
    assert_eq!(storage.update_task_status(&running).unwrap(), TaskStatus::Processing);
    // A late PENDING write never regresses a running task.
    let late = task.with_status(TaskStatus::Pending);
    assert_eq!(storage.update_task_status(&late).unwrap(), TaskStatus::Processing);

    let done = task.with_status(TaskStatus::Completed);
    assert_eq!(storage.update_task_status(&done).unwrap(), TaskStatus::Completed);
    let stray = task.with_status(TaskStatus::Failed);
    assert_eq!(storage.update_task_status(&stray).unwrap(), TaskStatus::Completed);
}

#[test]
fn test_start_flow_requires_created_tasks() {
    let storage = InMemoryStorage::new();
    let task = one_task_flow(&storage);
    storage.start_flow(task.flow_id).unwrap();
    assert_eq!(storage.get_task(task.id).unwrap().status, TaskStatus::New);
    assert!(matches!(
        storage.start_flow(task.flow_id),
        Err(StorageError::NoTasksToStart(_))
    ));
}

#[test]
fn test_flow_status_follows_tasks() {
    let storage = InMemoryStorage::new();
    let task = one_task_flow(&storage);
    assert_eq!(storage.flow_status(task.flow_id).unwrap(), FlowStatus::New);

    storage.update_task_status(&task.with_status(TaskStatus::Pending)).unwrap();
    assert_eq!(storage.flow_status(task.flow_id).unwrap(), FlowStatus::InProgress);

    storage.update_task_status(&task.with_status(TaskStatus::OnHold)).unwrap();
    assert_eq!(storage.flow_status(task.flow_id).unwrap(), FlowStatus::Stuck);
    assert_eq!(FlowStatus::Stuck.to_string(), "Stuck");
}

#[test]
fn test_status_serialization() {
    let json = serde_json::to_string(&TaskStatus::StoppedFailure).unwrap();
    assert_eq!(json, "\"STOPPED_FAILURE\"");
    let back: TaskStatus = serde_json::from_str("\"ON_HOLD\"").unwrap();
    assert_eq!(back, TaskStatus::OnHold);
    assert_eq!("Stop_Failed".parse::<TaskStatus>().unwrap(), TaskStatus::StoppedFailure);
    assert!("Running".parse::<TaskStatus>().is_err());
}

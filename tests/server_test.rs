//! Execution server lifecycle tests: startup cleanup and restart on fatal
//! errors.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{create_flow, test_config, wait_until, RecordingDispatcher, WAIT};
use prometheus_flow_scheduler::builders::{build_scheduler, build_server};
use prometheus_flow_scheduler::config::MachineConfig;
use prometheus_flow_scheduler::core::{FlowStatus, SchedulerError, Storage, TaskStatus};
use prometheus_flow_scheduler::infra::InMemoryStorage;
use prometheus_flow_scheduler::runtime::ExecutionServer;
use prometheus_flow_scheduler::util::init_tracing;

fn server(
    dispatcher: RecordingDispatcher,
) -> (Arc<InMemoryStorage>, Arc<RecordingDispatcher>, ExecutionServer<InMemoryStorage, RecordingDispatcher>) {
    init_tracing();
    let mut config = test_config();
    config.machines = vec![
        MachineConfig {
            id: 1,
            address: "10.0.0.1".into(),
            description: "worker-1".into(),
            active: true,
        },
        MachineConfig {
            id: 2,
            address: "10.0.0.2".into(),
            description: "worker-2".into(),
            active: true,
        },
    ];
    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(dispatcher);
    let server = build_server(config, Arc::clone(&storage), Arc::clone(&dispatcher)).unwrap();
    (storage, dispatcher, server)
}

#[test]
fn test_build_rejects_invalid_config() {
    let mut config = test_config();
    config.consumer_threads = 1;
    let result = build_scheduler(
        config,
        Arc::new(InMemoryStorage::new()),
        Arc::new(RecordingDispatcher::manual()),
    );
    assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
}

#[test]
fn test_server_runs_flows_from_configured_machines() {
    let (storage, dispatcher, server) = server(RecordingDispatcher::auto_complete());
    let flow = create_flow(&storage, &[2, 1]);
    server.start().unwrap();
    assert!(matches!(server.start(), Err(SchedulerError::AlreadyRunning)));

    server.controller().run_flow(flow).unwrap();
    assert!(wait_until(WAIT, || storage.flow_status(flow).unwrap() == FlowStatus::Completed));
    assert_eq!(dispatcher.executed().len(), 3);

    let registered = storage.get_all_machines(true).unwrap();
    assert_eq!(registered.len(), 3, "server entry plus two workers");

    server.stop();
    assert!(!server.scheduler().is_running());
    server.stop();
}

#[test]
fn test_start_fails_over_tasks_left_processing() {
    let (storage, dispatcher, server) = server(RecordingDispatcher::manual());
    let flow = create_flow(&storage, &[1]);
    let id = storage.get_tasks(flow).unwrap()[0].id;
    let mut stale = storage.get_task(id).unwrap().with_status(TaskStatus::Processing);
    stale.machine = Some(common::worker(1));
    storage.update_task_status(&stale).unwrap();

    server.start().unwrap();
    assert_eq!(dispatcher.killed(), vec![id]);
    assert_eq!(storage.get_task(id).unwrap().status, TaskStatus::Failed);
}

#[test]
fn test_fatal_error_restarts_scheduler() {
    let (storage, dispatcher, server) = server(RecordingDispatcher::manual());
    let flow = create_flow(&storage, &[1]);
    let id = storage.get_tasks(flow).unwrap()[0].id;
    server.start().unwrap();
    server.controller().run_flow(flow).unwrap();
    assert!(wait_until(WAIT, || dispatcher.is_running(id)));
    // Let the producer drain and go idle so the injected failure hits the report.
    thread::sleep(Duration::from_millis(100));

    storage.inject_failures(1);
    assert!(dispatcher.report(id, TaskStatus::Completed));

    assert!(wait_until(WAIT, || server.restarts() == 1));
    assert!(wait_until(WAIT, || server.scheduler().is_running()));
    // The worker no longer knows the task, so the restart fails it over.
    assert!(wait_until(WAIT, || storage.get_task(id).unwrap().status == TaskStatus::Failed));
    assert_eq!(dispatcher.killed(), vec![id]);

    // The restarted scheduler keeps working.
    let next = create_flow(&storage, &[1]);
    let next_id = storage.get_tasks(next).unwrap()[0].id;
    server.controller().run_flow(next).unwrap();
    assert!(wait_until(WAIT, || dispatcher.is_running(next_id)));
    assert!(dispatcher.report(next_id, TaskStatus::Completed));
    assert!(wait_until(WAIT, || storage.flow_status(next).unwrap() == FlowStatus::Completed));
}

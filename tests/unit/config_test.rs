//! Tests for configuration validation and loading

use std::io::Write;

use prometheus_flow_scheduler::config::{MachineConfig, SchedulerConfig};

fn machine(id: u64) -> MachineConfig {
    MachineConfig {
        id,
        address: format!("10.0.0.{id}"),
        description: String::new(),
        active: true,
    }
}

#[test]
fn test_config_rejects_single_consumer() {
    let cfg = SchedulerConfig {
        consumer_threads: 1,
        ..SchedulerConfig::default()
    };
    assert!(cfg.validate().unwrap_err().contains("consumer_threads"));
}

#[test]
fn test_config_rejects_zero_values() {
    let zero_capacity = SchedulerConfig {
        queue_capacity: 0,
        ..SchedulerConfig::default()
    };
    assert!(zero_capacity.validate().is_err());

    let zero_attempts = SchedulerConfig {
        storage_max_attempts: 0,
        ..SchedulerConfig::default()
    };
    assert!(zero_attempts.validate().is_err());

    let zero_idle = SchedulerConfig {
        producer_idle_timeout_secs: 0,
        ..SchedulerConfig::default()
    };
    assert!(zero_idle.validate().is_err());

    let zero_retry_delay = SchedulerConfig {
        storage_retry_delay_ms: 0,
        ..SchedulerConfig::default()
    };
    assert_eq!(
        zero_retry_delay.validate().unwrap_err(),
        "storage_retry_delay_ms must be greater than 0"
    );
}

#[test]
fn test_config_rejects_reserved_and_duplicate_machines() {
    let reserved = SchedulerConfig {
        machines: vec![machine(0)],
        ..SchedulerConfig::default()
    };
    assert!(reserved.validate().unwrap_err().contains("reserved"));

    let duplicate = SchedulerConfig {
        machines: vec![machine(3), machine(3)],
        ..SchedulerConfig::default()
    };
    assert!(duplicate.validate().unwrap_err().contains("defined twice"));
}

#[test]
fn test_config_from_json_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"consumer_threads": 4, "storage_retry_delay_ms": 250,
            "machines": [{{"id": 1, "address": "10.0.0.1", "active": false}}]}}"#
    )
    .unwrap();

    let cfg = SchedulerConfig::from_json_file(file.path()).unwrap();
    assert_eq!(cfg.consumer_threads, 4);
    assert_eq!(cfg.storage_retry_delay().as_millis(), 250);
    assert_eq!(cfg.machines.len(), 1);
    assert!(!cfg.machines[0].active);
}

#[test]
fn test_config_from_invalid_json_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"consumer_threads": 0}}"#).unwrap();
    let err = SchedulerConfig::from_json_file(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("consumer_threads"));

    assert!(SchedulerConfig::from_json_file("/nonexistent/scheduler.json").is_err());
    assert!(SchedulerConfig::from_json_str("not json").is_err());
}

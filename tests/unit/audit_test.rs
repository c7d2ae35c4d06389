//! Tests for audit sink

use prometheus_flow_scheduler::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink};

#[test]
fn test_in_memory_audit_sink() {
    let sink = InMemoryAuditSink::new(10);
    sink.record(build_audit_event(1, 7, AuditAction::Enqueue, None));
    sink.record(build_audit_event(2, 7, AuditAction::Hold, Some("no machine".into())));
    sink.record(build_audit_event(1, 7, AuditAction::Dispatch, Some("10.0.0.1".into())));

    assert_eq!(sink.events().len(), 3);
    let first = sink.events_for(1);
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].action, AuditAction::Enqueue);
    assert_eq!(first[1].payload.as_deref(), Some("10.0.0.1"));
    assert_ne!(first[0].event_id, first[1].event_id);
}

#[test]
fn test_audit_sink_overflow() {
    let sink = InMemoryAuditSink::new(2);
    sink.record(build_audit_event(1, 1, AuditAction::Enqueue, None));
    sink.record(build_audit_event(2, 1, AuditAction::Enqueue, None));
    sink.record(build_audit_event(3, 1, AuditAction::Enqueue, None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].task_id, 2); // oldest dropped
    assert_eq!(events[1].task_id, 3);
}

#[test]
fn test_audit_action_display() {
    assert_eq!(AuditAction::Release.to_string(), "release");
    assert_eq!(AuditAction::Expand.to_string(), "expand");
}

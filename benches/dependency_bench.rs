//! Benchmarks for the scheduling hot paths.
//!
//! Benchmarks cover:
//! - Dependency index registration and stage resolution
//! - Bounded queue offer/drain
//! - Status guard decisions and flow status derivation

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use prometheus_flow_scheduler::core::{
    BlockingSet, Context, DependencyIndex, FlowStatus, StageKey, Task, TaskStatus, UnitTemplate,
};
use prometheus_flow_scheduler::infra::BoundedTaskQueue;

fn task(id: u64, flow_id: u64, stage: u32) -> Task {
    let mut task = Task::new(stage, UnitTemplate::default(), Context::default());
    task.id = id;
    task.flow_id = flow_id;
    task.status = TaskStatus::Pending;
    task
}

// ============================================================================
// Dependency index
// ============================================================================

fn bench_stage_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_index");
    for width in [8u64, 64, 512] {
        group.throughput(Throughput::Elements(width));
        group.bench_with_input(BenchmarkId::new("resolve_stage", width), &width, |b, &width| {
            b.iter(|| {
                let mut index = DependencyIndex::default();
                let key = StageKey::new(1, 0);
                let blockers: BlockingSet = (0..width).collect();
                for id in 0..width {
                    index.register(key, blockers.clone(), task(width + id, 1, 1));
                }
                let mut released = 0;
                for id in 0..width {
                    if let Some(resolution) = index.complete(key, id, TaskStatus::Completed) {
                        released += resolution.dependents.len();
                    }
                }
                black_box(released)
            });
        });
    }
    group.finish();
}

fn bench_many_flows(c: &mut Criterion) {
    c.bench_function("dependency_index/100_flows", |b| {
        b.iter(|| {
            let mut index = DependencyIndex::default();
            for flow in 0..100u64 {
                let key = StageKey::new(flow, 0);
                let blockers: BlockingSet = [flow * 10, flow * 10 + 1].into_iter().collect();
                index.register(key, blockers, task(flow * 10 + 2, flow, 1));
            }
            for flow in 0..100u64 {
                let key = StageKey::new(flow, 0);
                index.complete(key, flow * 10, TaskStatus::Completed);
                black_box(index.complete(key, flow * 10 + 1, TaskStatus::Failed));
            }
            black_box(index.len())
        });
    });
}

// ============================================================================
// Queue and status guard
// ============================================================================

fn bench_queue_round_trip(c: &mut Criterion) {
    let queue = BoundedTaskQueue::new(500);
    let sample = task(1, 1, 0);
    c.bench_function("queue/offer_drain", |b| {
        b.iter(|| {
            for _ in 0..16 {
                queue.offer(sample.clone()).ok();
            }
            black_box(queue.drain())
        });
    });
}

fn bench_status_guard(c: &mut Criterion) {
    let all = [
        TaskStatus::Created,
        TaskStatus::New,
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Canceled,
        TaskStatus::Stopped,
        TaskStatus::StoppedFailure,
        TaskStatus::OnHold,
    ];
    c.bench_function("status/update_to", |b| {
        b.iter(|| {
            for current in all {
                for requested in all {
                    black_box(current.update_to(requested));
                }
            }
        });
    });
}

fn bench_flow_status(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_status");
    for size in [10usize, 1_000] {
        let mut statuses = vec![TaskStatus::Completed; size];
        statuses[size - 1] = TaskStatus::Processing;
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("derive", size), &statuses, |b, statuses| {
            b.iter(|| black_box(FlowStatus::derive(statuses.iter().copied())));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_flow_status,
    bench_stage_resolution,
    bench_many_flows,
    bench_queue_round_trip,
    bench_status_guard
);
criterion_main!(benches);

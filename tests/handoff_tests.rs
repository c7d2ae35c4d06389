//! Cross-thread behaviour of the single-writer hand-off cell.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use prometheus_flow_scheduler::HandOff;

// ============================================================================
// OWNERSHIP
// ============================================================================

#[test]
fn test_owner_can_block_without_pinning_the_lock() {
    let cell = Arc::new(HandOff::new(0u64));
    let guard = cell.acquire();

    // Observers only need the internal mutex, which the owner does not hold.
    let observer = {
        let cell = Arc::clone(&cell);
        thread::spawn(move || {
            let started = Instant::now();
            let held = cell.is_held();
            (held, started.elapsed())
        })
    };
    let (held, elapsed) = observer.join().unwrap();
    assert!(held);
    assert!(elapsed < Duration::from_secs(1));
    drop(guard);
    assert!(!cell.is_held());
}

#[test]
fn test_timed_acquire_succeeds_after_release() {
    let cell = Arc::new(HandOff::new(String::new()));
    let mut guard = cell.acquire();

    let waiter = {
        let cell = Arc::clone(&cell);
        thread::spawn(move || cell.acquire_for(Duration::from_secs(5)).map(|s| s.clone()))
    };
    thread::sleep(Duration::from_millis(50));
    guard.push_str("released");
    drop(guard);

    assert_eq!(waiter.join().unwrap().as_deref(), Some("released"));
}

// ============================================================================
// CONTENTION
// ============================================================================

#[test]
fn test_single_writer_under_contention() {
    let cell = Arc::new(HandOff::new(0usize));
    let writers = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cell = Arc::clone(&cell);
            let writers = Arc::clone(&writers);
            thread::spawn(move || {
                for _ in 0..1000 {
                    let mut value = cell.acquire();
                    assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                    *value += 1;
                    writers.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*cell.acquire(), 8000);
}

#[test]
fn test_try_acquire_never_blocks() {
    let cell = Arc::new(HandOff::new(()));
    let guard = cell.acquire();
    let contender = {
        let cell = Arc::clone(&cell);
        thread::spawn(move || cell.try_acquire().is_none())
    };
    assert!(contender.join().unwrap());
    drop(guard);
}

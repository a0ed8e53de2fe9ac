#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bean_async::worker_pool::{BackpressureMode, PoolError, WorkerPool, WorkerPoolConfig};
use common::wait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

// These tests are affected by global env vars. Use a mutex to serialize access.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Helper to clean worker pool env vars to ensure test isolation
fn clean_worker_pool_env_vars() {
    std::env::remove_var("BEAN_POOL_WORKERS");
    std::env::remove_var("BEAN_POOL_QUEUE_BOUND");
    std::env::remove_var("BEAN_POOL_BACKPRESSURE_MODE");
    std::env::remove_var("BEAN_POOL_BACKPRESSURE_TIMEOUT_MS");
    std::env::remove_var("BEAN_POOL_STACK_SIZE");
}

fn gate_task(gate: &Arc<AtomicBool>) -> Box<dyn FnOnce() + Send + 'static> {
    let gate = Arc::clone(gate);
    Box::new(move || {
        while !gate.load(Ordering::SeqCst) {
            may::coroutine::sleep(Duration::from_millis(2));
        }
    })
}

#[test]
fn test_config_from_env() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clean_worker_pool_env_vars();

    std::env::set_var("BEAN_POOL_WORKERS", "8");
    std::env::set_var("BEAN_POOL_QUEUE_BOUND", "0");
    std::env::set_var("BEAN_POOL_BACKPRESSURE_MODE", "shed");
    std::env::set_var("BEAN_POOL_BACKPRESSURE_TIMEOUT_MS", "250");
    std::env::set_var("BEAN_POOL_STACK_SIZE", "0x8000");

    let config = WorkerPoolConfig::from_env();
    assert_eq!(config.num_workers, 8);
    assert_eq!(config.queue_bound, 0);
    assert_eq!(config.backpressure_mode, BackpressureMode::Shed);
    assert_eq!(config.backpressure_timeout_ms, 250);
    assert_eq!(config.stack_size, 0x8000);

    clean_worker_pool_env_vars();
}

#[test]
fn test_config_from_env_ignores_garbage() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clean_worker_pool_env_vars();

    std::env::set_var("BEAN_POOL_WORKERS", "many");
    std::env::set_var("BEAN_POOL_BACKPRESSURE_MODE", "drop-everything");

    let config = WorkerPoolConfig::from_env();
    assert_eq!(config.num_workers, 4);
    assert_eq!(config.backpressure_mode, BackpressureMode::Block);

    clean_worker_pool_env_vars();
}

/// At most `num_workers` tasks run at the same time
#[test]
fn test_bounded_concurrency() {
    may::config().set_workers(2);

    let pool = WorkerPool::new(
        "bounded",
        WorkerPoolConfig::new(2, 0, BackpressureMode::Block, 50, 0x10000),
    )
    .unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..12 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let done = Arc::clone(&done);
        pool.submit(Box::new(move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            may::coroutine::sleep(Duration::from_millis(10));
            running.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    }

    assert!(wait::until(TIMEOUT, || done.load(Ordering::SeqCst) == 12));
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.metrics().get_completed_count(), 12);
    assert_eq!(pool.metrics().get_in_flight(), 0);
}

#[test]
fn test_shed_mode_rejects_when_full() {
    may::config().set_workers(2);

    let pool = WorkerPool::new(
        "shedder",
        WorkerPoolConfig::new(1, 2, BackpressureMode::Shed, 50, 0x10000),
    )
    .unwrap();

    let gate = Arc::new(AtomicBool::new(false));
    pool.submit(gate_task(&gate)).unwrap();
    pool.submit(gate_task(&gate)).unwrap();

    let started = Instant::now();
    let err = pool.submit(Box::new(|| {})).unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(matches!(
        err,
        PoolError::Saturated { ref name, queue_bound: 2 } if name == "shedder"
    ));
    assert_eq!(pool.metrics().get_shed_count(), 1);

    gate.store(true, Ordering::SeqCst);
    assert!(wait::until(TIMEOUT, || pool.metrics().get_completed_count() == 2));

    // Capacity is back once the queue drains
    pool.submit(Box::new(|| {})).unwrap();
}

#[test]
fn test_block_mode_times_out() {
    may::config().set_workers(2);

    let pool = WorkerPool::new(
        "blocker",
        WorkerPoolConfig::new(1, 1, BackpressureMode::Block, 30, 0x10000),
    )
    .unwrap();

    let gate = Arc::new(AtomicBool::new(false));
    pool.submit(gate_task(&gate)).unwrap();

    let started = Instant::now();
    let err = pool.submit(Box::new(|| {})).unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(matches!(err, PoolError::Saturated { .. }));

    gate.store(true, Ordering::SeqCst);
    assert!(wait::until(TIMEOUT, || pool.metrics().get_in_flight() == 0));
}

#[test]
fn test_block_mode_waits_for_free_slot() {
    may::config().set_workers(2);

    let pool = WorkerPool::new(
        "patient",
        WorkerPoolConfig::new(1, 1, BackpressureMode::Block, 2_000, 0x10000),
    )
    .unwrap();

    let gate = Arc::new(AtomicBool::new(false));
    pool.submit(gate_task(&gate)).unwrap();

    let opener = Arc::clone(&gate);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(40));
        opener.store(true, Ordering::SeqCst);
    });

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    pool.submit(Box::new(move || flag.store(true, Ordering::SeqCst)))
        .unwrap();
    handle.join().unwrap();

    assert!(wait::until(TIMEOUT, || ran.load(Ordering::SeqCst)));
    assert_eq!(pool.metrics().get_shed_count(), 0);
}

#[test]
fn test_close_drains_queue_and_rejects_new_tasks() {
    may::config().set_workers(2);

    let pool = WorkerPool::new(
        "draining",
        WorkerPoolConfig::new(1, 0, BackpressureMode::Block, 50, 0x10000),
    )
    .unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let counter = Arc::clone(&runs);
        pool.submit(Box::new(move || {
            may::coroutine::sleep(Duration::from_millis(2));
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    }
    pool.close();

    assert!(pool.is_closed());
    assert!(matches!(
        pool.submit(Box::new(|| {})),
        Err(PoolError::Closed { .. })
    ));
    assert!(wait::until(TIMEOUT, || runs.load(Ordering::SeqCst) == 5));
}

#[test]
fn test_panicking_task_does_not_kill_worker() {
    may::config().set_workers(2);

    let pool = WorkerPool::new(
        "sturdy",
        WorkerPoolConfig::new(1, 0, BackpressureMode::Block, 50, 0x10000),
    )
    .unwrap();

    pool.submit(Box::new(|| panic!("worker task exploded")))
        .unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    pool.submit(Box::new(move || flag.store(true, Ordering::SeqCst)))
        .unwrap();

    assert!(wait::until(TIMEOUT, || ran.load(Ordering::SeqCst)));
    assert_eq!(pool.metrics().get_panicked_count(), 1);
    assert_eq!(pool.metrics().get_completed_count(), 2);
}

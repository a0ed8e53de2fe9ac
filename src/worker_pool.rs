//! # Worker Pool Module
//!
//! Bounded-concurrency executors for background work. A pool owns a fixed set of
//! worker coroutines that share one task queue.
//!
//! ## Features
//!
//! - **Bounded Concurrency**: at most `num_workers` tasks of a pool run at once
//! - **Bounded Queue**: at most `queue_bound` tasks are queued or running (0 = unbounded)
//! - **Backpressure**: a full queue either sheds the task immediately or blocks the
//!   submitter for up to `backpressure_timeout_ms`, sleeping with jittered backoff
//! - **Panic Isolation**: each task runs under `catch_unwind`, a panicking task never
//!   takes its worker down
//! - **Metrics**: dispatched, completed, shed and panicked counts, plus in-flight depth
//!
//! ## Configuration
//!
//! - `BEAN_POOL_WORKERS`: Number of worker coroutines per pool (default: 4)
//! - `BEAN_POOL_QUEUE_BOUND`: Maximum queued plus running tasks (default: 1024)
//! - `BEAN_POOL_BACKPRESSURE_MODE`: `block` or `shed` (default: `block`)
//! - `BEAN_POOL_BACKPRESSURE_TIMEOUT_MS`: How long `block` waits for a slot (default: 50)
//! - `BEAN_POOL_STACK_SIZE`: Worker coroutine stack size (default: 0x10000)

use crate::helpers::jitter_backoff;
use crate::recovery::panic_message;
use crate::runtime_config::{parse_stack_size, DEFAULT_STACK_SIZE};
use may::sync::mpsc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A unit of work accepted by a pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Errors returned by pool lookup and submission.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool {name:?} not found")]
    NotFound { name: String },
    #[error("worker pool {name:?} is already registered")]
    AlreadyRegistered { name: String },
    #[error("worker pool {name:?} is saturated ({queue_bound} tasks in flight)")]
    Saturated { name: String, queue_bound: usize },
    #[error("worker pool {name:?} is closed")]
    Closed { name: String },
    #[error("worker pool {name:?} could not spawn any worker")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration for worker pool backpressure behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Wait for a free slot up to the configured timeout, then reject
    #[default]
    Block,
    /// Reject immediately when the queue is full
    Shed,
}

impl FromStr for BackpressureMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "shed" => Ok(Self::Shed),
            _ => Err(()),
        }
    }
}

/// Configuration for a worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker coroutines
    pub num_workers: usize,
    /// Maximum number of queued plus running tasks; 0 disables the bound
    pub queue_bound: usize,
    /// Backpressure mode
    pub backpressure_mode: BackpressureMode,
    /// Timeout for block mode in milliseconds
    pub backpressure_timeout_ms: u64,
    /// Stack size for worker coroutines
    pub stack_size: usize,
}

impl WorkerPoolConfig {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let num_workers = std::env::var("BEAN_POOL_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.num_workers);

        let queue_bound = std::env::var("BEAN_POOL_QUEUE_BOUND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.queue_bound);

        let backpressure_mode = std::env::var("BEAN_POOL_BACKPRESSURE_MODE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let backpressure_timeout_ms = std::env::var("BEAN_POOL_BACKPRESSURE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.backpressure_timeout_ms);

        let stack_size = std::env::var("BEAN_POOL_STACK_SIZE")
            .ok()
            .and_then(|s| parse_stack_size(&s))
            .unwrap_or(defaults.stack_size);

        Self {
            num_workers,
            queue_bound,
            backpressure_mode,
            backpressure_timeout_ms,
            stack_size,
        }
    }

    /// Create a custom configuration
    #[must_use]
    pub fn new(
        num_workers: usize,
        queue_bound: usize,
        backpressure_mode: BackpressureMode,
        backpressure_timeout_ms: u64,
        stack_size: usize,
    ) -> Self {
        Self {
            num_workers,
            queue_bound,
            backpressure_mode,
            backpressure_timeout_ms,
            stack_size,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_bound: 1024,
            backpressure_mode: BackpressureMode::Block,
            backpressure_timeout_ms: 50,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Metrics for a worker pool
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    /// Number of tasks rejected because the queue stayed full
    pub shed_count: AtomicU64,
    /// Tasks accepted but not yet finished
    pub in_flight: AtomicUsize,
    /// Total tasks accepted
    pub dispatched_count: AtomicU64,
    /// Total tasks finished, panicked or not
    pub completed_count: AtomicU64,
    /// Tasks that panicked inside a worker
    pub panicked_count: AtomicU64,
}

impl WorkerPoolMetrics {
    /// Create new metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a shed event
    pub fn record_shed(&self) {
        self.shed_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted task. The in-flight slot was already reserved.
    pub fn record_dispatch(&self) {
        self.dispatched_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished task and free its slot
    pub fn record_completion(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record a task that panicked inside a worker
    pub fn record_panic(&self) {
        self.panicked_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current shed count
    #[must_use]
    pub fn get_shed_count(&self) -> u64 {
        self.shed_count.load(Ordering::Relaxed)
    }

    /// Get number of queued plus running tasks
    #[must_use]
    pub fn get_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Get total dispatched count
    #[must_use]
    pub fn get_dispatched_count(&self) -> u64 {
        self.dispatched_count.load(Ordering::Relaxed)
    }

    /// Get total completed count
    #[must_use]
    pub fn get_completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    /// Get panicked task count
    #[must_use]
    pub fn get_panicked_count(&self) -> u64 {
        self.panicked_count.load(Ordering::Relaxed)
    }
}

/// A pool of worker coroutines with a bounded queue and backpressure
pub struct WorkerPool {
    name: String,
    config: WorkerPoolConfig,
    /// `None` once the pool is closed; dropping the sender lets workers drain and exit
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    closed: AtomicBool,
    metrics: Arc<WorkerPoolMetrics>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create a new worker pool and spawn its workers.
    ///
    /// The `may` runtime is configured lazily on first spawn; call
    /// `may::config()` before this if the defaults do not fit.
    ///
    /// Fails only if not a single worker could be spawned. A partially spawned
    /// pool is logged and kept, running with fewer workers.
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Result<Self, PoolError> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Task>();
        let metrics = Arc::new(WorkerPoolMetrics::new());

        // All workers share the receiver and load balance across tasks
        let rx = Arc::new(rx);

        info!(
            pool_name = %name,
            num_workers = config.num_workers,
            queue_bound = config.queue_bound,
            backpressure_mode = ?config.backpressure_mode,
            stack_size = config.stack_size,
            "Creating worker pool"
        );

        let mut spawned = 0usize;
        let mut last_error = None;
        for worker_id in 0..config.num_workers.max(1) {
            let rx = Arc::clone(&rx);
            let metrics = Arc::clone(&metrics);
            let pool_name = name.clone();

            // SAFETY: may::coroutine::Builder::spawn() is unsafe because the coroutine must
            // not rely on thread-local state across yields. The worker loop holds no
            // thread-locals, only owned Arc handles, and every task it runs is 'static.
            let spawn_result = unsafe {
                may::coroutine::Builder::new()
                    .name(format!("{name}-{worker_id}"))
                    .stack_size(config.stack_size)
                    .spawn(move || worker_loop(&pool_name, worker_id, &rx, &metrics))
            };

            match spawn_result {
                Ok(_) => spawned += 1,
                Err(e) => {
                    error!(
                        pool_name = %name,
                        worker_id = worker_id,
                        error = %e,
                        "Failed to spawn worker coroutine"
                    );
                    last_error = Some(e);
                }
            }
        }

        if spawned == 0 {
            if let Some(source) = last_error {
                return Err(PoolError::Spawn { name, source });
            }
        }

        Ok(Self {
            name,
            config,
            sender: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Submit a task to the pool.
    ///
    /// With [`BackpressureMode::Block`] this may block the caller for up to
    /// `backpressure_timeout_ms` while the queue is full.
    pub fn submit(&self, task: Task) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        self.reserve_slot()?;

        let sent = {
            let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(sender) => sender.send(task).map_err(|e| Some(e.to_string())),
                None => Err(None),
            }
        };

        match sent {
            Ok(()) => {
                self.metrics.record_dispatch();
                Ok(())
            }
            Err(reason) => {
                self.metrics.in_flight.fetch_sub(1, Ordering::AcqRel);
                if let Some(reason) = reason {
                    error!(
                        pool_name = %self.name,
                        error = %reason,
                        "Worker pool channel disconnected"
                    );
                }
                Err(self.closed_error())
            }
        }
    }

    /// Stop accepting tasks. Already queued tasks still run.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
        info!(
            pool_name = %self.name,
            in_flight = self.metrics.get_in_flight(),
            "Worker pool closed"
        );
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get metrics for this worker pool
    #[must_use]
    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.metrics
    }

    /// Get configuration for this worker pool
    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed {
            name: self.name.clone(),
        }
    }

    fn try_reserve(&self) -> bool {
        let bound = self.config.queue_bound;
        self.metrics
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (bound == 0 || depth < bound).then_some(depth + 1)
            })
            .is_ok()
    }

    fn reserve_slot(&self) -> Result<(), PoolError> {
        if self.try_reserve() {
            return Ok(());
        }

        if self.config.backpressure_mode == BackpressureMode::Block {
            let deadline =
                Instant::now() + Duration::from_millis(self.config.backpressure_timeout_ms);
            let mut attempt = 0u32;
            loop {
                let now = Instant::now();
                if now >= deadline || self.is_closed() {
                    break;
                }
                let pause = jitter_backoff(
                    Duration::from_micros(200),
                    Duration::from_millis(10),
                    attempt,
                )
                .min(deadline - now);
                may::coroutine::sleep(pause);
                if self.try_reserve() {
                    debug!(
                        pool_name = %self.name,
                        attempts = attempt + 1,
                        "Slot freed while blocking on full pool"
                    );
                    return Ok(());
                }
                attempt += 1;
            }
        }

        if self.is_closed() {
            return Err(self.closed_error());
        }

        self.metrics.record_shed();
        warn!(
            pool_name = %self.name,
            queue_bound = self.config.queue_bound,
            backpressure_mode = ?self.config.backpressure_mode,
            "Worker pool saturated - task rejected"
        );
        Err(PoolError::Saturated {
            name: self.name.clone(),
            queue_bound: self.config.queue_bound,
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn worker_loop(
    pool_name: &str,
    worker_id: usize,
    rx: &mpsc::Receiver<Task>,
    metrics: &WorkerPoolMetrics,
) {
    debug!(pool_name = %pool_name, worker_id = worker_id, "Worker coroutine started");

    // All senders dropped means the pool is closed and the queue is drained
    while let Ok(task) = rx.recv() {
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            metrics.record_panic();
            error!(
                pool_name = %pool_name,
                worker_id = worker_id,
                panic_message = %panic_message(panic.as_ref()),
                "Pooled task panicked"
            );
        }
        metrics.record_completion();
    }

    debug!(pool_name = %pool_name, worker_id = worker_id, "Worker coroutine exiting");
}

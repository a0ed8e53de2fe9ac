//! # Executor Module
//!
//! Fire-and-forget background execution.
//!
//! [`Executor::run_detached`] schedules a unit of work on a fresh coroutine or,
//! when a pool name is given, on a named [`WorkerPool`](crate::worker_pool::WorkerPool).
//! [`Executor::run_detached_with_context`] does the same for work that needs
//! the triggering request: it hands the work a [`DetachedContext`] copied from
//! the request instead of the request itself.
//!
//! Neither entry point returns anything or can fail. A panic inside the work, a
//! pool that rejects the task, or a pool that does not exist is absorbed here
//! and only shows up in the logs and the error-tracking service.
//!
//! ## One invocation
//!
//! ```text
//! Created → ContextDetached → Executing → [Faulted → Recovered → Reported]
//!         → SpanClosed → ContextReleased → Done
//! ```
//!
//! Every invocation runs its work at most once. There is no retry, no timeout
//! and no cancellation.
//!
//! ## Pool resolution
//!
//! | `pool_name` | Lookup | Result |
//! |---|---|---|
//! | `None` | - | new coroutine |
//! | `Some(name)` | found | submitted to the pool; a rejection is reported as a fault |
//! | `Some(name)` | missing or closed | warning naming the pool, then a new coroutine |

use crate::config::ConfigHandle;
use crate::context::{DetachedContext, RequestContext};
use crate::ids::TaskId;
use crate::recovery::{self, RecoveredFault, Recoverer};
use crate::registry::PoolRegistry;
use crate::reporting;
use crate::runtime_config::RuntimeConfig;
use crate::worker_pool::Task;
use once_cell::sync::Lazy;
use sentry::Hub;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

static GLOBAL_EXECUTOR: Lazy<Executor> =
    Lazy::new(|| Executor::new(ConfigHandle::global().clone(), PoolRegistry::global()));

/// Counters describing what the executor has done so far.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    scheduled: AtomicU64,
    completed: AtomicU64,
    recovered: AtomicU64,
    reported: AtomicU64,
    pool_fallbacks: AtomicU64,
    rejected: AtomicU64,
    spans_started: AtomicU64,
}

impl ExecutorMetrics {
    pub fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// A scheduled task finished running, successfully or not.
    pub fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_recovered(&self) {
        self.recovered.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_reported(&self) {
        self.reported.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_fallback(&self) {
        self.pool_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// A task was dropped without running (pool rejection, spawn failure).
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_span(&self) {
        self.spans_started.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn scheduled_count(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn recovered_count(&self) -> u64 {
        self.recovered.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn reported_count(&self) -> u64 {
        self.reported.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pool_fallback_count(&self) -> u64 {
        self.pool_fallbacks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn spans_started_count(&self) -> u64 {
        self.spans_started.load(Ordering::Relaxed)
    }

    /// Tasks that have either finished or been dropped.
    #[must_use]
    pub fn settled_count(&self) -> u64 {
        self.completed_count() + self.rejected_count()
    }
}

/// Schedules panic-safe background work.
///
/// Cheap to clone; clones share configuration, pools and metrics.
#[derive(Clone)]
pub struct Executor {
    config: ConfigHandle,
    pools: Arc<PoolRegistry>,
    runtime: Arc<RuntimeConfig>,
    metrics: Arc<ExecutorMetrics>,
}

impl Executor {
    /// Create an executor reading `config` at every invocation and resolving
    /// pool names against `pools`.
    #[must_use]
    pub fn new(config: ConfigHandle, pools: Arc<PoolRegistry>) -> Self {
        Self {
            config,
            pools,
            runtime: Arc::new(RuntimeConfig::from_env()),
            metrics: Arc::new(ExecutorMetrics::default()),
        }
    }

    #[must_use]
    pub fn with_runtime_config(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = Arc::new(runtime);
        self
    }

    /// The process-wide executor behind [`crate::execute`].
    #[must_use]
    pub fn global() -> &'static Executor {
        &GLOBAL_EXECUTOR
    }

    #[must_use]
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    #[must_use]
    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ExecutorMetrics> {
        &self.metrics
    }

    fn recoverer(&self) -> Recoverer {
        Recoverer::new(self.config.clone(), Arc::clone(&self.metrics))
    }

    /// Schedule `work` to run in the background.
    ///
    /// Returns as soon as the work is handed off. With `pool_name` the hand-off
    /// may wait on the pool's backpressure.
    pub fn run_detached<F>(&self, work: F, pool_name: Option<&str>)
    where
        F: FnOnce() + Send + 'static,
    {
        let task_id = TaskId::new();
        let parent = Hub::current();
        self.schedule(task_id, parent, work, pool_name);
    }

    /// Schedule `work` with a detached copy of `request`.
    ///
    /// The copy is taken from the request's context pool now, and goes back to
    /// it after the work has run and any fault has been reported, however the
    /// work ends. Reporting setup (hub, span) happens when the work starts, so
    /// it follows the configuration current at that time.
    ///
    /// Work that reports on its own should capture through
    /// [`DetachedContext::hub`]; `Hub::current()` inside the work is whatever
    /// the worker thread carries.
    #[track_caller]
    pub fn run_detached_with_context<F>(
        &self,
        work: F,
        request: &RequestContext,
        pool_name: Option<&str>,
    ) where
        F: FnOnce(&mut DetachedContext) + Send + 'static,
    {
        let caller = Location::caller();
        let task_id = TaskId::new();
        let parent = request.hub().cloned().unwrap_or_else(Hub::current);

        let mut detached = request.context_pool().acquire();
        detached.reset(request);

        let config = self.config.clone();
        let metrics = Arc::clone(&self.metrics);
        let recoverer = self.recoverer();
        let task_parent = Arc::clone(&parent);

        let body = move || {
            let mut detached = detached;
            let snapshot = config.load();
            let span = reporting::bind(&snapshot, &mut *detached, Arc::clone(&task_parent), caller);
            if span.is_some() {
                metrics.record_span();
            }

            // The hub stays bound to the context only. Installing it as the
            // thread's current hub would leak it to every coroutine that runs
            // on this thread while the work is parked.
            let outcome = recovery::catch(|| work(&mut *detached));
            if let Err(fault) = outcome {
                recoverer.report(task_id, &fault, &task_parent, Some(&*detached));
            }

            // Span closes before the context goes back to its pool
            drop(span);
            drop(detached);
        };

        debug!(
            task_id = %task_id,
            request_id = %request.request_id(),
            path = %request.path(),
            caller = %caller,
            "Scheduling background task with detached context"
        );
        self.schedule(task_id, parent, body, pool_name);
    }

    fn schedule<F>(&self, task_id: TaskId, parent: Arc<Hub>, work: F, pool_name: Option<&str>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.metrics.record_scheduled();

        let recoverer = self.recoverer();
        let metrics = Arc::clone(&self.metrics);
        let task_parent = Arc::clone(&parent);
        let task: Task = Box::new(move || {
            if let Err(fault) = recovery::catch(work) {
                recoverer.report(task_id, &fault, &task_parent, None);
            }
            metrics.record_completion();
        });

        let Some(name) = pool_name else {
            self.spawn_unpooled(task_id, task, &parent);
            return;
        };

        match self.pools.get(name) {
            Ok(pool) => {
                debug!(task_id = %task_id, pool_name = %name, "Submitting background task to pool");
                if let Err(e) = pool.submit(task) {
                    self.metrics.record_rejected();
                    self.recoverer()
                        .report(task_id, &RecoveredFault::Submission(e), &parent, None);
                }
            }
            Err(e) => {
                warn!(
                    task_id = %task_id,
                    pool_name = %name,
                    error = %e,
                    "Async task will execute without worker pool, the pool name is {name:?}"
                );
                self.metrics.record_fallback();
                self.spawn_unpooled(task_id, task, &parent);
            }
        }
    }

    fn spawn_unpooled(&self, task_id: TaskId, task: Task, parent: &Arc<Hub>) {
        // SAFETY: may::coroutine::Builder::spawn() is unsafe because the coroutine must not
        // rely on thread-local state across yields. `task` is 'static and owns everything
        // it touches, and it never installs a thread-local hub: the request hub lives in
        // the detached context.
        let spawn_result = unsafe {
            may::coroutine::Builder::new()
                .name(self.runtime.coroutine_name.clone())
                .stack_size(self.runtime.stack_size)
                .spawn(task)
        };

        if let Err(e) = spawn_result {
            error!(
                task_id = %task_id,
                stack_size = self.runtime.stack_size,
                error = %e,
                "Failed to spawn background coroutine"
            );
            self.metrics.record_rejected();
            self.recoverer()
                .report(task_id, &RecoveredFault::Spawn(e), parent, None);
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("pools", &self.pools.names())
            .field("runtime", &self.runtime)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Run `work` in the background on the process-wide executor.
///
/// ```no_run
/// bean_async::execute(|| println!("sent welcome mail"), None);
/// bean_async::execute(|| println!("resized avatar"), Some("images"));
/// ```
pub fn execute<F>(work: F, pool_name: Option<&str>)
where
    F: FnOnce() + Send + 'static,
{
    Executor::global().run_detached(work, pool_name);
}

/// Run `work` in the background with a detached copy of `request`, on the
/// process-wide executor.
#[track_caller]
pub fn execute_with_context<F>(work: F, request: &RequestContext, pool_name: Option<&str>)
where
    F: FnOnce(&mut DetachedContext) + Send + 'static,
{
    Executor::global().run_detached_with_context(work, request, pool_name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_settled_count() {
        let metrics = ExecutorMetrics::default();
        metrics.record_scheduled();
        metrics.record_scheduled();
        metrics.record_completion();
        metrics.record_rejected();
        assert_eq!(metrics.scheduled_count(), 2);
        assert_eq!(metrics.settled_count(), 2);
    }

    #[test]
    fn test_executor_clones_share_metrics() {
        let executor = Executor::new(ConfigHandle::default(), Arc::new(PoolRegistry::new()));
        let clone = executor.clone();
        executor.metrics().record_scheduled();
        assert_eq!(clone.metrics().scheduled_count(), 1);
    }
}

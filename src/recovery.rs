//! # Panic Recovery
//!
//! The boundary between a unit of work and the thread of execution that runs
//! it. [`catch`] turns an unwinding panic into a [`RecoveredFault`] value;
//! [`Recoverer::report`] logs the fault and, when reporting is on, forwards it
//! to the error-tracking service on a cloned hub. Faults are never re-raised.
//!
//! Scheduling failures (a pool that rejects the task, a coroutine that cannot
//! be spawned) go through the same [`Recoverer::report`] path, so every way a
//! background task can fail ends up in the same log line and the same
//! dashboard.

use crate::config::ConfigHandle;
use crate::context::DetachedContext;
use crate::executor::ExecutorMetrics;
use crate::ids::TaskId;
use crate::reporting;
use crate::worker_pool::PoolError;
use sentry::Hub;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// A failure intercepted on a background execution path.
#[derive(Debug)]
pub enum RecoveredFault {
    /// The unit of work panicked
    Panic { message: String },
    /// A named pool refused the task
    Submission(PoolError),
    /// No coroutine could be spawned for the task
    Spawn(std::io::Error),
}

impl RecoveredFault {
    /// Exception type used when the fault is reported.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RecoveredFault::Panic { .. } => "panic",
            RecoveredFault::Submission(_) => "submission",
            RecoveredFault::Spawn(_) => "spawn",
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        RecoveredFault::Panic {
            message: panic_message(payload.as_ref()),
        }
    }
}

impl fmt::Display for RecoveredFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveredFault::Panic { message } => f.write_str(message),
            RecoveredFault::Submission(e) => write!(f, "{e}"),
            RecoveredFault::Spawn(e) => write!(f, "failed to spawn background task: {e}"),
        }
    }
}

/// Best-effort text of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Run `f`, converting a panic into a [`RecoveredFault`].
pub fn catch<F, R>(f: F) -> Result<R, RecoveredFault>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(RecoveredFault::from_panic)
}

/// Logs recovered faults and forwards them to the reporting sink.
#[derive(Clone)]
pub struct Recoverer {
    config: ConfigHandle,
    metrics: Arc<ExecutorMetrics>,
}

impl Recoverer {
    #[must_use]
    pub fn new(config: ConfigHandle, metrics: Arc<ExecutorMetrics>) -> Self {
        Self { config, metrics }
    }

    /// Report a fault.
    ///
    /// With reporting on, the fault is captured on a clone of the context's hub
    /// (or of `parent` when there is none), tagged as coming from a background
    /// task and enriched with the request. It is always logged.
    pub fn report(
        &self,
        task_id: TaskId,
        fault: &RecoveredFault,
        parent: &Arc<Hub>,
        context: Option<&DetachedContext>,
    ) {
        self.metrics.record_recovered();

        let snapshot = self.config.load();
        if snapshot.sentry().on {
            let base = context
                .and_then(DetachedContext::hub)
                .map_or_else(|| Arc::clone(parent), Arc::clone);
            let hub = Hub::new_from_top(base);
            hub.configure_scope(|scope| {
                if let Some(ctx) = context {
                    reporting::apply_request_scope(scope, ctx);
                }
                scope.set_tag(reporting::TASK_TAG, "true");
                scope.set_tag("task_id", task_id);
            });
            let event_id = hub.capture_event(reporting::fault_event(fault));
            self.metrics.record_reported();
            debug!(task_id = %task_id, event_id = %event_id, "Fault forwarded to error reporting");
        }

        match context {
            Some(ctx) => error!(
                task_id = %task_id,
                fault_kind = fault.kind(),
                request_id = ?ctx.request_id(),
                method = %ctx.method(),
                path = %ctx.path(),
                panic_message = %fault,
                "Background task failed - recovered"
            ),
            None => error!(
                task_id = %task_id,
                fault_kind = fault.kind(),
                panic_message = %fault,
                "Background task failed - recovered"
            ),
        }
    }
}

impl fmt::Debug for Recoverer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recoverer").finish_non_exhaustive()
    }
}

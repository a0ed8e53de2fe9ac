//! Error reporting sink adapter.
//!
//! Everything the async core says to the error-tracking service goes through
//! here: cloning hubs so concurrent reports do not share scope state, enriching
//! a scope with request metadata, turning recovered faults into events, and
//! opening the optional tracing span around a detached task.

use crate::config::ConfigSnapshot;
use crate::context::DetachedContext;
use crate::recovery::RecoveredFault;
use http::Method;
use sentry::protocol::{Event, Exception, Level, Mechanism, Request, Url};
use sentry::{Hub, Scope, Transaction, TransactionContext};
use std::collections::BTreeMap;
use std::panic::Location;
use std::sync::Arc;
use tracing::debug;

/// Tag set on every report that comes from a background task.
pub const TASK_TAG: &str = "async_task";

/// Operation name of spans opened around detached tasks.
pub const SPAN_OP: &str = "http";

/// Transaction name of a detached task, e.g. `"POST /orders ASYNC"`.
#[must_use]
pub fn transaction_name(method: &Method, path: &str) -> String {
    format!("{method} {path} ASYNC")
}

/// Absolute URL of the request, when a `Host` header says where it was sent.
///
/// The scheme comes from `x-forwarded-proto` and defaults to `http`.
#[must_use]
pub fn request_url(ctx: &DetachedContext) -> Option<Url> {
    let host = ctx.header("host")?;
    let scheme = ctx.header("x-forwarded-proto").unwrap_or("http");
    Url::parse(&format!("{scheme}://{host}{}", ctx.path())).ok()
}

/// Attach request metadata from `ctx` to every event captured through `scope`.
pub fn apply_request_scope(scope: &mut Scope, ctx: &DetachedContext) {
    let url = request_url(ctx);
    let query_string = url.as_ref().and_then(|u| u.query().map(str::to_string));
    let request = Request {
        url,
        query_string,
        method: Some(ctx.method().to_string()),
        headers: ctx
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        env: BTreeMap::from([("PATH_INFO".to_string(), ctx.path().to_string())]),
        ..Default::default()
    };

    scope.set_transaction(Some(&transaction_name(ctx.method(), ctx.path())));
    if let Some(request_id) = ctx.request_id() {
        scope.set_tag("request_id", request_id);
    }
    scope.add_event_processor(move |mut event| {
        if event.request.is_none() {
            event.request = Some(request.clone());
        }
        Some(event)
    });
}

/// Build the event reported for a recovered fault.
#[must_use]
pub fn fault_event(fault: &RecoveredFault) -> Event<'static> {
    Event {
        level: Level::Error,
        exception: vec![Exception {
            ty: fault.kind().to_string(),
            value: Some(fault.to_string()),
            mechanism: Some(Mechanism {
                ty: "bean.async".to_string(),
                handled: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }]
        .into(),
        ..Default::default()
    }
}

/// What span, if any, to open for one detached task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanPlan {
    pub name: String,
    pub op: &'static str,
    /// The scheduling call site, `file:line`
    pub description: String,
    /// `Some(false)` forces the span out of sampling; `None` leaves it to the client
    pub sampled: Option<bool>,
}

impl SpanPlan {
    /// Decide the span for `ctx` under `snapshot`.
    ///
    /// Returns `None` when reporting is off or the sample rate is zero. A span
    /// for a path matching a skip pattern is still opened but marked not sampled.
    #[must_use]
    pub fn for_context(
        snapshot: &ConfigSnapshot,
        ctx: &DetachedContext,
        caller: &Location<'_>,
    ) -> Option<Self> {
        let sentry = snapshot.sentry();
        if !sentry.on || sentry.sample_rate() <= 0.0 {
            return None;
        }

        let sampled = snapshot.skips_traces_for(ctx.path()).then_some(false);
        Some(Self {
            name: transaction_name(ctx.method(), ctx.path()),
            op: SPAN_OP,
            description: format!("{}:{}", caller.file(), caller.line()),
            sampled,
        })
    }
}

/// Tracing span around one detached task. Finished when dropped.
pub struct TaskSpan {
    plan: SpanPlan,
    transaction: Option<Transaction>,
}

impl TaskSpan {
    #[must_use]
    pub fn plan(&self) -> &SpanPlan {
        &self.plan
    }

    /// `false` when the request path matched a skip pattern.
    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.plan.sampled != Some(false)
    }

    /// Finish the span now instead of at drop.
    pub fn finish(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            transaction.finish();
            debug!(span = %self.plan.name, "Task span finished");
        }
    }
}

impl Drop for TaskSpan {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TaskSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpan")
            .field("plan", &self.plan)
            .field("open", &self.transaction.is_some())
            .finish()
    }
}

/// Bind error reporting into a detached context.
///
/// When reporting is on, a fresh hub cloned from `parent` is enriched with the
/// request and bound to `ctx`, and a span is opened if [`SpanPlan::for_context`]
/// asks for one. The span continues any trace carried in the request headers.
pub fn bind(
    snapshot: &ConfigSnapshot,
    ctx: &mut DetachedContext,
    parent: Arc<Hub>,
    caller: &Location<'_>,
) -> Option<TaskSpan> {
    if !snapshot.sentry().on {
        return None;
    }

    let hub = Arc::new(Hub::new_from_top(parent));
    hub.configure_scope(|scope| apply_request_scope(scope, ctx));
    ctx.bind_hub(Arc::clone(&hub));

    let plan = SpanPlan::for_context(snapshot, ctx, caller)?;

    let mut tx_ctx = TransactionContext::continue_from_headers(
        &plan.name,
        plan.op,
        ctx.headers().iter().map(|(k, v)| (k.as_ref(), v.as_str())),
    );
    if let Some(sampled) = plan.sampled {
        tx_ctx.set_sampled(sampled);
    }

    let transaction = Hub::run(Arc::clone(&hub), || sentry::start_transaction(tx_ctx));
    transaction.set_data("caller", plan.description.clone().into());
    hub.configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));

    debug!(
        span = %plan.name,
        sampled = ?plan.sampled,
        caller = %plan.description,
        "Task span started"
    );
    Some(TaskSpan {
        plan,
        transaction: Some(transaction),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BeanConfig;
    use crate::context::{ContextPool, RequestContext};

    fn snapshot(on: bool, rate: f64, skip: &[&str]) -> ConfigSnapshot {
        let mut config = BeanConfig::default();
        config.sentry.on = on;
        config.sentry.traces_sample_rate = rate;
        config.sentry.skip_traces_endpoints = skip.iter().map(|s| s.to_string()).collect();
        ConfigSnapshot::new(config)
    }

    fn detached(path: &str) -> DetachedContext {
        let pool = Arc::new(ContextPool::default());
        let req = RequestContext::new(pool, Method::GET, path);
        let mut ctx = DetachedContext::default();
        ctx.reset(&req);
        ctx
    }

    #[test]
    fn test_transaction_name() {
        assert_eq!(transaction_name(&Method::POST, "/orders"), "POST /orders ASYNC");
    }

    #[test]
    fn test_span_plan_skip_path_not_sampled() {
        let snap = snapshot(true, 1.0, &["^/ping$"]);
        let plan = SpanPlan::for_context(&snap, &detached("/ping"), Location::caller()).unwrap();
        assert_eq!(plan.name, "GET /ping ASYNC");
        assert_eq!(plan.op, "http");
        assert_eq!(plan.sampled, Some(false));
        assert!(plan.description.contains("reporting.rs"));
    }

    #[test]
    fn test_span_plan_other_path_left_to_client() {
        let snap = snapshot(true, 1.0, &["^/ping$"]);
        let plan = SpanPlan::for_context(&snap, &detached("/orders"), Location::caller()).unwrap();
        assert_eq!(plan.sampled, None);
    }

    #[test]
    fn test_no_span_when_rate_zero_or_reporting_off() {
        let ctx = detached("/orders");
        assert!(SpanPlan::for_context(&snapshot(true, 0.0, &[]), &ctx, Location::caller()).is_none());
        assert!(SpanPlan::for_context(&snapshot(false, 1.0, &[]), &ctx, Location::caller()).is_none());
    }

    #[test]
    fn test_bind_without_reporting_leaves_context_alone() {
        let mut ctx = detached("/orders");
        let span = bind(&snapshot(false, 1.0, &[]), &mut ctx, Hub::current(), Location::caller());
        assert!(span.is_none());
        assert!(ctx.hub().is_none());
    }

    #[test]
    fn test_bind_with_reporting_binds_hub_and_span() {
        let mut ctx = detached("/ping");
        let span = bind(
            &snapshot(true, 1.0, &["^/ping$"]),
            &mut ctx,
            Hub::current(),
            Location::caller(),
        )
        .unwrap();
        assert!(ctx.hub().is_some());
        assert!(!span.is_sampled());
        assert_eq!(span.plan().name, "GET /ping ASYNC");
        assert!(span.plan().description.contains("reporting.rs"));
        span.finish();
    }

    #[test]
    fn test_request_url_from_host_header() {
        let pool = Arc::new(ContextPool::default());
        let req = RequestContext::new(pool, Method::GET, "/search?q=beans")
            .with_header("Host", "shop.example.com")
            .with_header("X-Forwarded-Proto", "https");
        let mut ctx = DetachedContext::default();
        ctx.reset(&req);

        let url = request_url(&ctx).unwrap();
        assert_eq!(url.as_str(), "https://shop.example.com/search?q=beans");
        assert_eq!(url.query(), Some("q=beans"));
        assert!(request_url(&detached("/orders")).is_none());
    }

    #[test]
    fn test_fault_event_shape() {
        let fault = RecoveredFault::Panic {
            message: "boom".into(),
        };
        let event = fault_event(&fault);
        let exception = &event.exception.values[0];
        assert_eq!(exception.ty, "panic");
        assert_eq!(exception.value.as_deref(), Some("boom"));
        assert_eq!(exception.mechanism.as_ref().and_then(|m| m.handled), Some(true));
    }
}

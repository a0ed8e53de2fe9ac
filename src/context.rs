//! # Context Module
//!
//! Request contexts and the detached copies handed to background work.
//!
//! A [`RequestContext`] describes the inbound request that is being served. It
//! may carry a deadline, a handler binding and request-scoped values, and it
//! goes away when the request finishes. Background work must never hold on to
//! it. Instead the executor acquires a [`DetachedContext`] from the request's
//! [`ContextPool`], resets it from the request, and hands that copy to the work.
//!
//! ## Lifecycle
//!
//! ```text
//! ContextPool::acquire ──► PooledContext ──reset(&request)──► work(&mut ctx)
//!                                                                  │
//!                    ContextPool::release ◄── Drop ◄── recovery ◄──┘
//! ```
//!
//! Release happens in `Drop for PooledContext`, so it runs exactly once on every
//! exit path, including when the work panics.

use crate::ids::RequestId;
use http::Method;
use sentry::Hub;
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::trace;

/// Maximum inline headers before heap allocation
pub const MAX_INLINE_HEADERS: usize = 16;

/// Stack-allocated header storage. Names are `Arc<str>` so copying a context is cheap.
pub type HeaderVec = SmallVec<[(Arc<str>, String); MAX_INLINE_HEADERS]>;

/// Default number of idle contexts a pool keeps for reuse
pub const DEFAULT_MAX_IDLE: usize = 256;

/// Header carrying the caller-supplied request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The inbound, request-scoped context.
pub struct RequestContext {
    request_id: RequestId,
    method: Method,
    path: String,
    headers: HeaderVec,
    handler_name: Option<String>,
    deadline: Option<Instant>,
    values: HashMap<String, Value>,
    hub: Option<Arc<Hub>>,
    contexts: Arc<ContextPool>,
}

impl RequestContext {
    /// Create a request context whose detached copies come from `contexts`.
    pub fn new(contexts: Arc<ContextPool>, method: Method, path: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            method,
            path: path.into(),
            headers: HeaderVec::new(),
            handler_name: None,
            deadline: None,
            values: HashMap::new(),
            hub: None,
            contexts,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    /// Add a header. A valid `x-request-id` header also sets the request id.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if name.eq_ignore_ascii_case(REQUEST_ID_HEADER) {
            if let Some(request_id) = RequestId::from_header(&value) {
                self.request_id = request_id;
            }
        }
        self.headers.push((Arc::from(name), value));
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler_name: impl Into<String>) -> Self {
        self.handler_name = Some(handler_name.into());
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Attach the error-reporting hub serving this request.
    #[must_use]
    pub fn with_hub(mut self, hub: Arc<Hub>) -> Self {
        self.hub = Some(hub);
        self
    }

    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderVec {
        &self.headers
    }

    /// Get a header by name (case-insensitive per RFC 7230)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    #[must_use]
    pub fn handler_name(&self) -> Option<&str> {
        self.handler_name.as_deref()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn hub(&self) -> Option<&Arc<Hub>> {
        self.hub.as_ref()
    }

    /// The pool detached copies of this request are drawn from.
    #[must_use]
    pub fn context_pool(&self) -> &Arc<ContextPool> {
        &self.contexts
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers.len())
            .field("handler_name", &self.handler_name)
            .field("deadline", &self.deadline)
            .field("has_hub", &self.hub.is_some())
            .finish_non_exhaustive()
    }
}

/// A background-safe copy of a request's metadata.
///
/// Carries no deadline and no handler binding: the work it is handed to may
/// outlive the request.
#[derive(Default)]
pub struct DetachedContext {
    request_id: Option<RequestId>,
    method: Method,
    path: String,
    headers: HeaderVec,
    values: HashMap<String, Value>,
    hub: Option<Arc<Hub>>,
    resets: u64,
}

impl DetachedContext {
    /// Re-initialize from `request`.
    ///
    /// Copies the request id, method, path and headers. Request-scoped values,
    /// the deadline, the handler binding and the request's hub are not carried over.
    pub fn reset(&mut self, request: &RequestContext) {
        self.clear();
        self.request_id = Some(request.request_id);
        self.method = request.method.clone();
        self.path.push_str(&request.path);
        self.headers.extend(request.headers.iter().cloned());
        self.resets += 1;
    }

    fn clear(&mut self) {
        self.request_id = None;
        self.method = Method::GET;
        self.path.clear();
        self.headers.clear();
        self.values.clear();
        self.hub = None;
    }

    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderVec {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// The error-reporting hub bound for this task, if reporting is on.
    #[must_use]
    pub fn hub(&self) -> Option<&Arc<Hub>> {
        self.hub.as_ref()
    }

    pub(crate) fn bind_hub(&mut self, hub: Arc<Hub>) {
        self.hub = Some(hub);
    }

    /// How many times this object has been reset. Grows as the pool reuses it.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.resets
    }
}

impl fmt::Debug for DetachedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers.len())
            .field("has_hub", &self.hub.is_some())
            .field("generation", &self.resets)
            .finish_non_exhaustive()
    }
}

fn find_header<'a>(headers: &'a HeaderVec, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Reusable pool of [`DetachedContext`] objects.
#[derive(Debug)]
pub struct ContextPool {
    idle: Mutex<Vec<DetachedContext>>,
    max_idle: usize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl ContextPool {
    #[must_use]
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Take a context out of the pool, allocating one if none is idle.
    ///
    /// The returned guard releases the context when dropped.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> PooledContext {
        let ctx = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        self.acquired.fetch_add(1, Ordering::AcqRel);
        PooledContext {
            ctx,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut ctx: DetachedContext) {
        ctx.clear();
        {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < self.max_idle {
                idle.push(ctx);
            }
        }
        let released = self.released.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(released = released, "Detached context released");
    }

    #[must_use]
    pub fn acquired_count(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    /// Contexts acquired and not yet released.
    #[must_use]
    pub fn in_use(&self) -> u64 {
        self.acquired_count()
            .saturating_sub(self.released_count())
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

/// A [`DetachedContext`] on loan from a [`ContextPool`].
pub struct PooledContext {
    ctx: DetachedContext,
    pool: Arc<ContextPool>,
}

impl Deref for PooledContext {
    type Target = DetachedContext;

    fn deref(&self) -> &DetachedContext {
        &self.ctx
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut DetachedContext {
        &mut self.ctx
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.ctx));
    }
}

impl fmt::Debug for PooledContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledContext").field(&self.ctx).finish()
    }
}

//! # bean-async
//!
//! **bean-async** runs fire-and-forget background work for a web service on
//! `may` coroutines, without ever letting that work take the process down.
//!
//! ## Overview
//!
//! A handler that wants to send a mail, warm a cache or call a webhook after it
//! has answered calls [`execute`] (or [`execute_with_context`] when the work
//! needs the request) and returns immediately. The work then runs on a fresh
//! coroutine or on a named worker pool. A panic inside it is caught, logged and
//! reported to the error-tracking service together with the request it came
//! from. The caller never sees it.
//!
//! ## Architecture
//!
//! - **[`executor`]** - the two entry points and pool resolution
//! - **[`recovery`]** - panic interception and fault reporting
//! - **[`context`]** - request contexts, detached copies and their pool
//! - **[`reporting`]** - hub cloning, request enrichment and task spans
//! - **[`worker_pool`]** / **[`registry`]** - bounded named worker pools
//! - **[`config`]** - YAML/env configuration with atomic hot swap
//! - **[`telemetry`]** - logging and error-reporting bootstrap
//!
//! ### Detached execution with a request
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Handler
//!     participant Exec as executor
//!     participant Pool as ContextPool
//!     participant Worker as coroutine / WorkerPool
//!     participant Report as reporting
//!     participant Sink as error tracking
//!
//!     Handler->>Exec: execute_with_context(work, &request, pool)
//!     Exec->>Pool: acquire()
//!     Pool-->>Exec: PooledContext
//!     Exec->>Exec: reset(&request)
//!     Exec->>Worker: schedule(body)
//!     Exec-->>Handler: returns
//!     Worker->>Report: bind(hub, span)
//!     Worker->>Worker: catch(work(&mut ctx))
//!     alt work panicked
//!         Worker->>Sink: capture_event(fault)
//!     end
//!     Worker->>Report: span closed
//!     Worker->>Pool: release (Drop)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use bean_async::{execute, execute_with_context, ContextPool, RequestContext};
//! use http::Method;
//! use std::sync::Arc;
//!
//! let contexts = Arc::new(ContextPool::default());
//! let request = RequestContext::new(contexts, Method::POST, "/orders")
//!     .with_header("x-request-id", "01ARZ3NDEKTSV4RRFFQ69G5FAV");
//!
//! execute(|| println!("cache warmed"), None);
//! execute_with_context(
//!     |ctx| println!("confirmation for {}", ctx.path()),
//!     &request,
//!     Some("mailer"),
//! );
//! ```

pub mod config;
pub mod context;
pub mod executor;
pub mod helpers;
pub mod ids;
pub mod recovery;
pub mod registry;
pub mod reporting;
pub mod runtime_config;
pub mod telemetry;
pub mod worker_pool;

pub use config::{BeanConfig, ConfigHandle};
pub use context::{ContextPool, DetachedContext, RequestContext};
pub use executor::{execute, execute_with_context, Executor, ExecutorMetrics};
pub use recovery::RecoveredFault;
pub use registry::PoolRegistry;
pub use worker_pool::{BackpressureMode, WorkerPoolConfig};

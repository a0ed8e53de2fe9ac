//! # Configuration Module
//!
//! Process-wide settings read by the async core: whether error reporting is on,
//! the tracing sample rate, which request paths skip trace sampling, and the
//! named worker pools to register at startup.
//!
//! Configuration is initialized once at startup and then only read. It lives
//! behind a [`ConfigHandle`], which the executor loads on every invocation, so
//! a scheduled task always sees the configuration current at the time it runs.
//!
//! ## Sources
//!
//! - YAML, via [`BeanConfig::from_yaml_file`] / [`BeanConfig::from_yaml_str`]
//! - Environment, via [`BeanConfig::from_env`]:
//!
//! | Variable | Field |
//! |---|---|
//! | `BEAN_PROJECT_NAME` | `project_name` |
//! | `BEAN_ENVIRONMENT` | `environment` |
//! | `BEAN_SECRET` | `secret` |
//! | `BEAN_SENTRY_ON` | `sentry.on` |
//! | `BEAN_SENTRY_DEBUG` | `sentry.debug` |
//! | `BEAN_SENTRY_DSN` | `sentry.dsn` |
//! | `BEAN_SENTRY_TRACES_SAMPLE_RATE` | `sentry.traces_sample_rate` |
//! | `BEAN_SENTRY_SKIP_TRACES_ENDPOINTS` | `sentry.skip_traces_endpoints` (comma-separated) |
//!
//! ## Example
//!
//! ```yaml
//! projectName: shop
//! environment: production
//! secret: s3cr3t
//! sentry:
//!   on: true
//!   dsn: https://key@sentry.example.com/42
//!   tracesSampleRate: 0.25
//!   skipTracesEndpoints:
//!     - ^/ping$
//!     - ^/health
//! asyncTasks:
//!   pools:
//!     - name: mailer
//!       workers: 2
//!       queueBound: 64
//!       backpressureMode: block
//!       backpressureTimeoutMs: 50
//! ```

use crate::helpers::float_in_range;
use crate::worker_pool::{BackpressureMode, WorkerPoolConfig};
use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML configuration")]
    Parse(#[from] serde_yaml::Error),
}

/// A secret configuration value whose `Debug` output is redacted.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the raw value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<REDACTED>)")
    }
}

/// Error reporting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SentryConfig {
    /// Master switch for error reporting
    pub on: bool,
    /// Turn on the reporting client's own debug output
    pub debug: bool,
    /// Project DSN
    pub dsn: Option<Secret>,
    /// Environment tag attached to every report
    pub environment: Option<String>,
    /// Fraction of background tasks that get a tracing span (0.0 to 1.0)
    pub traces_sample_rate: f64,
    /// Regular expressions over the request path; a match marks the span as not sampled
    pub skip_traces_endpoints: Vec<String>,
    /// Flush timeout when the reporting client shuts down
    pub timeout_ms: u64,
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            on: false,
            debug: false,
            dsn: None,
            environment: None,
            traces_sample_rate: 0.0,
            skip_traces_endpoints: Vec::new(),
            timeout_ms: 2000,
        }
    }
}

impl SentryConfig {
    /// Sample rate clamped to `[0, 1]`.
    #[must_use]
    pub fn sample_rate(&self) -> f64 {
        float_in_range(self.traces_sample_rate, 0.0, 1.0)
    }
}

/// A named worker pool declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolSpec {
    pub name: String,
    pub workers: usize,
    pub queue_bound: usize,
    pub backpressure_mode: BackpressureMode,
    pub backpressure_timeout_ms: u64,
    pub stack_size: Option<usize>,
}

impl Default for PoolSpec {
    fn default() -> Self {
        let defaults = WorkerPoolConfig::default();
        Self {
            name: String::new(),
            workers: defaults.num_workers,
            queue_bound: defaults.queue_bound,
            backpressure_mode: defaults.backpressure_mode,
            backpressure_timeout_ms: defaults.backpressure_timeout_ms,
            stack_size: None,
        }
    }
}

impl PoolSpec {
    #[must_use]
    pub fn to_pool_config(&self) -> WorkerPoolConfig {
        let mut config = WorkerPoolConfig::new(
            self.workers,
            self.queue_bound,
            self.backpressure_mode,
            self.backpressure_timeout_ms,
            WorkerPoolConfig::default().stack_size,
        );
        if let Some(stack_size) = self.stack_size {
            config.stack_size = stack_size;
        }
        config
    }
}

/// Settings for background task execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AsyncConfig {
    pub pools: Vec<PoolSpec>,
}

/// Top-level framework configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BeanConfig {
    pub project_name: String,
    pub environment: String,
    pub secret: Option<Secret>,
    pub sentry: SentryConfig,
    pub async_tasks: AsyncConfig,
}

impl Default for BeanConfig {
    fn default() -> Self {
        Self {
            project_name: "bean".to_string(),
            environment: "development".to_string(),
            secret: None,
            sentry: SentryConfig::default(),
            async_tasks: AsyncConfig::default(),
        }
    }
}

impl BeanConfig {
    /// Load configuration from environment variables with defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let sentry_defaults = SentryConfig::default();

        let sentry = SentryConfig {
            on: env_bool("BEAN_SENTRY_ON").unwrap_or(sentry_defaults.on),
            debug: env_bool("BEAN_SENTRY_DEBUG").unwrap_or(sentry_defaults.debug),
            dsn: env::var("BEAN_SENTRY_DSN").ok().map(Secret::new),
            environment: env::var("BEAN_ENVIRONMENT").ok(),
            traces_sample_rate: env::var("BEAN_SENTRY_TRACES_SAMPLE_RATE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(sentry_defaults.traces_sample_rate),
            skip_traces_endpoints: env::var("BEAN_SENTRY_SKIP_TRACES_ENDPOINTS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            timeout_ms: env::var("BEAN_SENTRY_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(sentry_defaults.timeout_ms),
        };

        Self {
            project_name: env::var("BEAN_PROJECT_NAME").unwrap_or(defaults.project_name),
            environment: env::var("BEAN_ENVIRONMENT").unwrap_or(defaults.environment),
            secret: env::var("BEAN_SECRET").ok().map(Secret::new),
            sentry,
            async_tasks: AsyncConfig::default(),
        }
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML configuration file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .and_then(|v| match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

/// A stored configuration plus the skip patterns compiled from it.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub config: BeanConfig,
    skip_traces: Vec<Regex>,
}

impl ConfigSnapshot {
    /// Compile the snapshot. Patterns that fail to compile are logged and dropped.
    #[must_use]
    pub fn new(config: BeanConfig) -> Self {
        let skip_traces = config
            .sentry
            .skip_traces_endpoints
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Ignoring invalid skip-traces pattern");
                    None
                }
            })
            .collect();
        Self {
            config,
            skip_traces,
        }
    }

    #[must_use]
    pub fn sentry(&self) -> &SentryConfig {
        &self.config.sentry
    }

    /// Whether tracing for `path` should be marked as not sampled.
    ///
    /// Patterns are tried in order and the first match wins.
    #[must_use]
    pub fn skips_traces_for(&self, path: &str) -> bool {
        self.skip_traces.iter().any(|re| re.is_match(path))
    }
}

/// Shared, swappable configuration.
///
/// Cloning the handle shares the same underlying slot.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<ConfigSnapshot>>,
}

static GLOBAL_CONFIG: Lazy<ConfigHandle> = Lazy::new(|| ConfigHandle::new(BeanConfig::from_env()));

impl ConfigHandle {
    #[must_use]
    pub fn new(config: BeanConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(ConfigSnapshot::new(config))),
        }
    }

    /// The process-wide handle, seeded from the environment on first use.
    #[must_use]
    pub fn global() -> &'static ConfigHandle {
        &GLOBAL_CONFIG
    }

    /// Current snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    /// Replace the configuration. Tasks already running keep the snapshot they loaded.
    pub fn store(&self, config: BeanConfig) {
        self.inner.store(Arc::new(ConfigSnapshot::new(config)));
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(BeanConfig::default())
    }
}

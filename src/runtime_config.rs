//! # Runtime Configuration Module
//!
//! Environment-driven settings for the coroutines that carry unpooled
//! background work.
//!
//! ## Environment Variables
//!
//! ### `BEAN_STACK_SIZE`
//!
//! Stack size for every coroutine spawned by [`Executor::run_detached`]
//! without a pool. Accepts values in:
//! - Decimal: `65536` (64 KB)
//! - Hexadecimal: `0x10000` (64 KB)
//!
//! Default: `0x10000` (64 KB)
//!
//! Background work tends to be heavier than a request handler, so the default
//! is larger than a plain handler stack. Tune it down for many tiny tasks, up
//! for deep recursion. Too small overflows the coroutine stack, which aborts
//! the process and cannot be recovered.
//!
//! ### `BEAN_ASYNC_NAME`
//!
//! Coroutine name prefix shown in debuggers and panic messages.
//! Default: `bean-async`.
//!
//! ## Usage
//!
//! ```rust
//! use bean_async::runtime_config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env();
//! println!("Stack size: {} bytes", config.stack_size);
//! ```
//!
//! [`Executor::run_detached`]: crate::executor::Executor::run_detached

use std::env;

/// Default coroutine stack size (64 KB).
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size for background coroutines in bytes
    pub stack_size: usize,
    /// Name given to spawned background coroutines
    pub coroutine_name: String,
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let stack_size = env::var("BEAN_STACK_SIZE")
            .ok()
            .and_then(|val| parse_stack_size(&val))
            .unwrap_or(DEFAULT_STACK_SIZE);
        let coroutine_name =
            env::var("BEAN_ASYNC_NAME").unwrap_or_else(|_| "bean-async".to_string());
        RuntimeConfig {
            stack_size,
            coroutine_name,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            coroutine_name: "bean-async".to_string(),
        }
    }
}

/// Parse a stack size given either in decimal or `0x`-prefixed hexadecimal.
#[must_use]
pub fn parse_stack_size(val: &str) -> Option<usize> {
    let val = val.trim();
    if let Some(hex) = val.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        val.parse().ok()
    }
}

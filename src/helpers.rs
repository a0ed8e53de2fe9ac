//! Small numeric helpers shared by the executor and the worker pools.

use rand::Rng;
use std::time::Duration;

/// Clamp `value` into `[min, max]`.
///
/// NaN collapses to `min`, so a garbage sample rate never enables tracing.
#[must_use]
pub fn float_in_range(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        return min;
    }
    value.clamp(min, max)
}

/// Capped exponential backoff with jitter.
///
/// The delay for `attempt` is `min(max, min * 2^attempt)`; half of it is kept
/// as the floor and a random amount up to that half is added on top. The result
/// never drops below `min`.
///
/// See <http://www.awsarchitectureblog.com/2015/03/backoff.html>.
#[must_use]
pub fn jitter_backoff(min: Duration, max: Duration, attempt: u32) -> Duration {
    let base = min.as_nanos() as f64;
    let cap = max.as_nanos() as f64;

    let temp = cap.min(base * 2f64.powi(attempt.min(63) as i32));
    let half = (temp / 2.0) as u64;
    let jitter = if half == 0 {
        0
    } else {
        rand::rng().random_range(0..half)
    };

    Duration::from_nanos(half.saturating_add(jitter)).max(min)
}

//! Exponential retry delays with jitter.
//!
//! `delay = min(base * 2^attempt, MAX_BACKOFF) + jitter`, where jitter is drawn
//! uniformly from `[0, 10%)` of the capped value. Jitter is added after the cap,
//! so the effective delay may exceed `MAX_BACKOFF` by up to 10%.

use std::time::Duration;

use rand::Rng;

/// Ceiling applied to the exponential term, before jitter.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Attempts above this are clamped before exponentiation.
pub const MAX_EXPONENT: i64 = 10;

const JITTER_FRACTION: f64 = 0.1;

/// Delay before the next attempt, with random jitter.
///
/// Negative attempts count as 0. A zero base yields a zero delay.
pub fn next_backoff(base: Duration, attempt: i64) -> Duration {
    let unit = rand::thread_rng().gen_range(0.0..1.0);
    backoff_with_jitter(base, attempt, unit)
}

/// Same as [`next_backoff`] with the jitter draw supplied by the caller.
/// `unit` is clamped into `[0, 1)`.
pub fn backoff_with_jitter(base: Duration, attempt: i64, unit: f64) -> Duration {
    let exponent = attempt.clamp(0, MAX_EXPONENT) as i32;
    let exponential = base.as_secs_f64() * 2f64.powi(exponent);
    let capped = exponential.min(MAX_BACKOFF.as_secs_f64());

    let unit = if unit.is_finite() {
        unit.clamp(0.0, 1.0 - f64::EPSILON)
    } else {
        0.0
    };
    let jitter = capped * JITTER_FRACTION * unit;

    Duration::from_secs_f64((capped + jitter).max(0.0))
}

/// Whether another attempt is allowed after `current` failures.
pub fn should_retry(current: u32, max: u32) -> bool {
    current < max
}

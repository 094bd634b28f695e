//! Jittered exponential backoff

use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt`: `base * 2^attempt`, capped at `max`,
/// then spread by `±jitter` (a fraction, 0.25 = ±25%).
pub fn compute_retry_delay(attempt: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    let random = rand::thread_rng().gen::<f64>();
    compute_retry_delay_with(attempt, base, max, jitter, random)
}

/// Same as [`compute_retry_delay`] with the random draw supplied.
///
/// `random` is in `[0, 1)`; `0.5` yields the un-jittered delay.
pub fn compute_retry_delay_with(
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter: f64,
    random: f64,
) -> Duration {
    let base_ms = base.as_millis() as f64;
    let max_ms = max.as_millis() as f64;

    let exponential = base_ms * 2f64.powi(attempt.min(30) as i32);
    let capped = exponential.min(max_ms);

    let jitter = jitter.clamp(0.0, 1.0);
    let random = random.clamp(0.0, 1.0);
    let factor = 1.0 + jitter * (2.0 * random - 1.0);

    let delay = (capped * factor).round().clamp(0.0, max_ms);
    Duration::from_millis(delay as u64)
}

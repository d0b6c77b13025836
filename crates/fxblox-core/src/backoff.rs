// ── Backoff calculation ──

use std::time::Duration;

/// Exponential backoff with jitter, capped at `max`.
///
/// `delay = min(initial * 2^attempt * jitter, max)`
///
/// Jitter is +-25% so several devices redialing at once spread out.
pub(crate) fn delay_for(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = initial.as_secs_f64() * 2.0_f64.powi(exponent);

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (base * jitter_factor).max(0.0);

    let capped = with_jitter.min(max.as_secs_f64());
    Duration::from_secs_f64(capped)
}

//! Reconnect backoff: exponential growth with a cap and multiplicative jitter.

use std::time::Duration;

use rand::Rng;

/// Deterministic part of the reconnect delay for attempt `n` (1-based):
/// `min(max, initial * 2^min(10, n-1))`.
pub fn reconnect_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    initial.saturating_mul(1u32 << exp).min(max)
}

/// Applies multiplicative jitter in `[0.8, 1.2]`.
pub fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor)
}

// ABOUTME: Pure retry decision for failed step attempts
// ABOUTME: Maps (retries already made, policy) to whether to retry and how long to wait

use std::time::Duration;

use crate::parser::RetryPolicy;

/// Decide whether a failed step gets another attempt.
///
/// `attempt` counts the retries already made (0 after the first failure).
/// The delay grows as `initial_delay * backoff_multiplier^attempt`, capped at
/// `max_delay`.
pub fn next_attempt(attempt: u32, policy: &RetryPolicy) -> (bool, Duration) {
    let retry = attempt < policy.max_retries;
    (retry, calculate_delay(attempt, policy))
}

pub fn calculate_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let seconds = policy.initial_delay.as_secs_f64() * policy.backoff_multiplier.powi(exponent);
    let max = policy.max_delay.as_secs_f64();

    if !seconds.is_finite() || seconds >= max {
        policy.max_delay
    } else {
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

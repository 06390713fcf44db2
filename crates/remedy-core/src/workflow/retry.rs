//! Bounded retry with exponential backoff and jitter.
//!
//! Executors front shared, rate-limited APIs. Transient errors are retried a
//! bounded number of times; permanent errors surface immediately.

use std::time::Duration;

use remedy_types::config::RetryPolicy;

use super::action::ActionError;

/// Stateless retry handler.
///
/// No internal state -- all logic is in associated functions that take the
/// policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should be made after `attempt` failed.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &ActionError) -> bool {
        error.is_transient() && attempt < policy.max_attempts
    }

    /// Delay before the attempt following `attempt`, with random jitter.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        Self::backoff_delay_with(policy, attempt, rand::random::<f64>())
    }

    /// Deterministic variant of [`backoff_delay`](Self::backoff_delay).
    ///
    /// `base × 2^(attempt-1)` capped at `max_delay_ms`, plus
    /// `sample × jitter × delay` where `sample` lies in [0, 1).
    pub fn backoff_delay_with(policy: &RetryPolicy, attempt: u32, sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = policy
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(policy.max_delay_ms) as f64;
        let jitter = sample.clamp(0.0, 1.0) * policy.jitter.clamp(0.0, 1.0) * delay;
        Duration::from_millis((delay + jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.5,
        }
    }

    #[test]
    fn test_should_retry_transient_within_limit() {
        let err = ActionError::Transient("503".to_string());
        assert!(RetryHandler::should_retry(&policy(), 1, &err));
        assert!(RetryHandler::should_retry(&policy(), 2, &err));
        assert!(!RetryHandler::should_retry(&policy(), 3, &err));
    }

    #[test]
    fn test_permanent_errors_never_retry() {
        let err = ActionError::Permanent("forbidden".to_string());
        assert!(!RetryHandler::should_retry(&policy(), 1, &err));
    }

    #[test]
    fn test_single_attempt_policy() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..policy()
        };
        let err = ActionError::Transient("reset".to_string());
        assert!(!RetryHandler::should_retry(&policy, 1, &err));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let p = policy();
        assert_eq!(RetryHandler::backoff_delay_with(&p, 1, 0.0), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff_delay_with(&p, 2, 0.0), Duration::from_millis(200));
        assert_eq!(RetryHandler::backoff_delay_with(&p, 3, 0.0), Duration::from_millis(400));
        assert_eq!(RetryHandler::backoff_delay_with(&p, 10, 0.0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = policy();
        // 200ms base at attempt 2, jitter 0.5 -> up to +100ms
        assert_eq!(RetryHandler::backoff_delay_with(&p, 2, 1.0), Duration::from_millis(300));
        for _ in 0..50 {
            let delay = RetryHandler::backoff_delay(&p, 2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }
}

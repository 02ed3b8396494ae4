//! Retry policy with exponential backoff and jitter.

use buildflow_core::{ActionStatus, Error};
use std::time::Duration;

/// Governs retries of transient failures.
///
/// Delay for attempt `n` (zero-based) is
/// `base * 2^n + uniform(0, base * 2^n / 4)`. Only transient failures -
/// transport errors, a worker dying mid-execution, explicit timeouts - are
/// retried; a nonzero exit or a missing declared output never is.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// No retries at all; useful in tests and fail-fast setups.
    pub fn none() -> Self {
        Self {
            base: Duration::from_millis(1),
            max_attempts: 0,
        }
    }

    /// Whether a further attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, err: &Error, attempt: u32) -> bool {
        attempt < self.max_attempts && err.is_retryable()
    }

    /// Whether a result status warrants a retry (timeouts are transient).
    pub fn status_retryable(status: ActionStatus) -> bool {
        status == ActionStatus::Timeout
    }

    /// Backoff before the next attempt (zero-based attempt index).
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_cap = (backoff.as_millis() / 4).max(1) as u64;
        let jitter = Duration::from_millis(rand::random::<u64>() % jitter_cap);
        backoff + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildflow_core::TargetId;

    #[test]
    fn test_delay_grows_and_stays_bounded() {
        let policy = RetryPolicy::new(Duration::from_millis(100), 5);
        for attempt in 0..5 {
            let base = Duration::from_millis(100 * 2u64.pow(attempt));
            let delay = policy.delay(attempt);
            assert!(delay >= base, "attempt {attempt}: {delay:?} < {base:?}");
            // Jitter adds at most a quarter of the base term.
            assert!(delay <= base + base / 4 + Duration::from_millis(1));
        }
    }

    #[test]
    fn test_only_transient_retryable() {
        let policy = RetryPolicy::default();
        let transient = Error::Transport("reset".into());
        let action = Error::ActionFailed {
            target: TargetId::from("t"),
            exit_code: 1,
        };
        let missing = Error::MissingDeclaredOutput {
            target: TargetId::from("t"),
            path: "out".into(),
        };
        assert!(policy.should_retry(&transient, 0));
        assert!(!policy.should_retry(&transient, 3));
        assert!(!policy.should_retry(&action, 0));
        assert!(!policy.should_retry(&missing, 0));
    }

    #[test]
    fn test_timeout_status_is_retryable() {
        assert!(RetryPolicy::status_retryable(ActionStatus::Timeout));
        assert!(!RetryPolicy::status_retryable(ActionStatus::Failure));
        assert!(!RetryPolicy::status_retryable(ActionStatus::Cancelled));
    }
}

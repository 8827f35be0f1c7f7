//! Retry decisions and backoff computation.
//!
//! Stateless: all logic lives in associated functions that take the policy
//! as a parameter. Attempts are 1-based (the first call is attempt 1).

use std::time::Duration;

use switchyard_types::error::StageError;
use switchyard_types::workflow::RetryPolicy;

pub struct RetryHandler;

impl RetryHandler {
    /// Whether a failed `attempt` should be followed by another one.
    ///
    /// Only transient errors retry, and never beyond `max_retries + 1`
    /// total attempts.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &StageError) -> bool {
        error.is_transient() && attempt < policy.max_attempts()
    }

    /// Delay before the attempt following `attempt`.
    ///
    /// `initial * multiplier^(attempt - 1)`, capped at `max_backoff_ms`.
    pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = policy.initial_backoff_ms as f64 * policy.multiplier.max(1.0).powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(policy.max_backoff_ms as f64)
        } else {
            policy.max_backoff_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unavailable() -> StageError {
        StageError::NodeUnavailable {
            node_id: "n".into(),
            message: "503".into(),
        }
    }

    #[test]
    fn test_backoff_sequence_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(RetryHandler::backoff(&policy, 1), Duration::from_millis(200));
        assert_eq!(RetryHandler::backoff(&policy, 2), Duration::from_millis(400));
        assert_eq!(RetryHandler::backoff(&policy, 3), Duration::from_millis(800));
        assert_eq!(RetryHandler::backoff(&policy, 5), Duration::from_millis(2_000));
        assert_eq!(RetryHandler::backoff(&policy, 60), Duration::from_millis(2_000));
    }

    #[test]
    fn test_backoff_parameterized() {
        let policy = RetryPolicy {
            max_retries: 4,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            multiplier: 3.0,
        };
        let delays: Vec<u64> = (1..=4)
            .map(|a| RetryHandler::backoff(&policy, a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 30, 50, 50]);
    }

    #[test]
    fn test_should_retry_bounded_by_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(RetryHandler::should_retry(&policy, 1, &unavailable()));
        assert!(RetryHandler::should_retry(&policy, 2, &unavailable()));
        assert!(!RetryHandler::should_retry(&policy, 3, &unavailable()));
        assert!(!RetryHandler::should_retry(&RetryPolicy::none(), 1, &unavailable()));
    }

    #[test]
    fn test_semantic_errors_never_retry() {
        let policy = RetryPolicy::default();
        assert!(!RetryHandler::should_retry(
            &policy,
            1,
            &StageError::InvalidInput("bad".into())
        ));
        assert!(!RetryHandler::should_retry(
            &policy,
            1,
            &StageError::ToolExecution {
                tool: "t".into(),
                message: "boom".into()
            }
        ));
    }
}

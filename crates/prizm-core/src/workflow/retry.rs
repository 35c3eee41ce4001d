//! Retry policy evaluation for failed steps.

use std::time::Duration;

use prizm_types::workflow::{FailureKind, RetryConfig};

/// Stateless retry handler; all logic lives in associated functions.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether a step that just failed on its `attempt`-th try (1-based)
    /// should run again.
    ///
    /// A step runs at most `max_retries + 1` times, and only failures whose
    /// kind is listed in `retry_on` are retried. No config means no retries.
    pub fn should_retry(config: Option<&RetryConfig>, attempt: u32, kind: FailureKind) -> bool {
        match config {
            Some(config) => {
                attempt < config.max_retries.saturating_add(1) && config.retry_on.contains(&kind)
            }
            None => false,
        }
    }

    /// Delay before the next attempt.
    pub fn delay(config: Option<&RetryConfig>) -> Duration {
        Duration::from_millis(config.map(|c| c.retry_delay_ms).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: u32, retry_on: Vec<FailureKind>) -> RetryConfig {
        RetryConfig {
            max_retries,
            retry_delay_ms: 25,
            retry_on,
        }
    }

    #[test]
    fn test_should_retry_within_limit() {
        let cfg = config(2, vec![FailureKind::Failed, FailureKind::Timeout]);
        assert!(RetryHandler::should_retry(Some(&cfg), 1, FailureKind::Failed));
        assert!(RetryHandler::should_retry(Some(&cfg), 2, FailureKind::Timeout));
        assert!(!RetryHandler::should_retry(Some(&cfg), 3, FailureKind::Failed));
    }

    #[test]
    fn test_should_not_retry_unlisted_kind() {
        let cfg = config(5, vec![FailureKind::Timeout]);
        assert!(!RetryHandler::should_retry(Some(&cfg), 1, FailureKind::Failed));
        assert!(RetryHandler::should_retry(Some(&cfg), 1, FailureKind::Timeout));
    }

    #[test]
    fn test_no_config_means_single_attempt() {
        assert!(!RetryHandler::should_retry(None, 1, FailureKind::Failed));
        let zero = config(0, vec![FailureKind::Failed]);
        assert!(!RetryHandler::should_retry(Some(&zero), 1, FailureKind::Failed));
    }

    #[test]
    fn test_delay() {
        let cfg = config(1, vec![]);
        assert_eq!(RetryHandler::delay(Some(&cfg)), Duration::from_millis(25));
        assert_eq!(RetryHandler::delay(None), Duration::ZERO);
    }
}

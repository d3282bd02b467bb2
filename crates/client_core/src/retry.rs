use std::time::Duration;

use shared::error::RemoteError;

/// Decides whether and when a failed remote call is retried.
///
/// `attempt` counts completed failures, so the first decision is made with
/// `attempt == 1`. Returning `None` from `retry_timeout` abandons the entity
/// to `Failed` even when `should_retry` said yes.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: u32, error: &RemoteError) -> bool;
    fn retry_timeout(&self, attempt: u32, error: &RemoteError) -> Option<Duration>;
}

/// Default policy: transient errors back off exponentially up to a cap and
/// retry until they succeed, permanent errors are never retried.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, _attempt: u32, error: &RemoteError) -> bool {
        error.is_transient()
    }

    fn retry_timeout(&self, attempt: u32, error: &RemoteError) -> Option<Duration> {
        if !error.is_transient() {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exponent);
        Some(delay.min(self.cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors_are_never_retried() {
        let policy = ExponentialBackoff::default();
        let error = RemoteError::validation("empty message");
        assert!(!policy.should_retry(1, &error));
        assert_eq!(policy.retry_timeout(1, &error), None);
    }

    #[test]
    fn transient_backoff_doubles_up_to_the_cap() {
        let policy = ExponentialBackoff {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(350),
        };
        let error = RemoteError::RateLimited;
        assert!(policy.should_retry(1, &error));
        assert_eq!(policy.retry_timeout(1, &error), Some(Duration::from_millis(100)));
        assert_eq!(policy.retry_timeout(2, &error), Some(Duration::from_millis(200)));
        assert_eq!(policy.retry_timeout(3, &error), Some(Duration::from_millis(350)));
        assert_eq!(policy.retry_timeout(10, &error), Some(Duration::from_millis(350)));
    }
}

//! Bounded exponential backoff for idempotent requests.

use std::time::{Duration, SystemTime};

use reqwest_retry::{RetryDecision, RetryPolicy};

/// Exponential backoff capped both per delay and in total elapsed time.
///
/// Only used for GETs (discovery, userinfo). Token endpoint calls are never
/// retried by middleware: a replayed code or device grant is not idempotent.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_elapsed: Duration,
}

impl BackoffPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    fn delay_for(&self, n_past_retries: u32) -> Duration {
        let factor = 2_u32.saturating_pow(n_past_retries);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl RetryPolicy for BackoffPolicy {
    fn should_retry(&self, request_start_time: SystemTime, n_past_retries: u32) -> RetryDecision {
        if n_past_retries >= self.max_retries {
            return RetryDecision::DoNotRetry;
        }

        let delay = self.delay_for(n_past_retries);
        let elapsed = SystemTime::now()
            .duration_since(request_start_time)
            .unwrap_or_default();
        if elapsed + delay > self.max_elapsed {
            return RetryDecision::DoNotRetry;
        }

        RetryDecision::Retry {
            execute_after: SystemTime::now() + delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles() {
        let policy = BackoffPolicy::new(3);
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::new(40);
        assert_eq!(policy.delay_for(35), Duration::from_secs(5));
    }

    #[test]
    fn test_stops_after_max_retries() {
        let policy = BackoffPolicy::new(2);
        assert!(matches!(
            policy.should_retry(SystemTime::now(), 2),
            RetryDecision::DoNotRetry
        ));
        assert!(matches!(
            policy.should_retry(SystemTime::now(), 1),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_stops_when_elapsed_budget_spent() {
        let policy = BackoffPolicy::new(5).with_max_elapsed(Duration::from_secs(1));
        let started = SystemTime::now() - Duration::from_secs(2);
        assert!(matches!(
            policy.should_retry(started, 0),
            RetryDecision::DoNotRetry
        ));
    }
}

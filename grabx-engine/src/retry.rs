//! Retry policy
//!
//! Decides whether a failed attempt is retried and after what delay. Only
//! transient failures are retried, never beyond `max_attempts`, with an
//! exponential backoff of `min(base * 2^(attempt - 1), cap)`.

use grabx_core::{GrabFailure, Job};
use std::time::Duration;

use crate::config::EngineConfig;

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base, config.backoff_cap)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides based on the job's attempt count and its recorded failure
    ///
    /// A job with no recorded failure has nothing to retry.
    pub fn decide(&self, job: &Job) -> RetryDecision {
        match &job.last_error {
            Some(failure) => self.decide_failure(job.attempt, failure),
            None => RetryDecision::GiveUp,
        }
    }

    /// Decides for a failure that ended attempt number `attempt`
    pub fn decide_failure(&self, attempt: u32, failure: &GrabFailure) -> RetryDecision {
        if !failure.is_transient() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.backoff(attempt))
    }

    /// Delay before the attempt following attempt number `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use grabx_core::{JobId, Target, Transition};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(200), Duration::from_secs(1));
    }

    #[test]
    fn test_transient_failure_retries_until_max() {
        let policy = policy();
        let failure = GrabFailure::transient("timeout");

        assert_eq!(
            policy.decide_failure(1, &failure),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide_failure(2, &failure),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(policy.decide_failure(3, &failure), RetryDecision::GiveUp);
    }

    #[test]
    fn test_permanent_failure_never_retries() {
        let policy = RetryPolicy::new(10, Duration::from_millis(1), Duration::from_millis(1));
        assert_eq!(
            policy.decide_failure(1, &GrabFailure::permanent("unauthorized")),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_decide_reads_job_state() {
        let policy = policy();
        let mut job = Job::new(JobId(1), Target::new("https://example.com"), Utc::now());
        assert_eq!(policy.decide(&job), RetryDecision::GiveUp);

        job.apply(Transition::Start, Utc::now()).unwrap();
        job.apply(Transition::Retry(GrabFailure::transient("503")), Utc::now())
            .unwrap();
        assert_eq!(
            policy.decide(&job),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
    }
}

//! Retry policy and exponential backoff with jitter

use std::time::Duration;

use rand::Rng;

/// How a transaction body is retried after a validation conflict
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Give up once this much wall-clock time has passed
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_micros(500),
            max_delay: Duration::from_millis(50),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    /// Many short retries for hot counters
    pub fn contended() -> Self {
        RetryPolicy {
            max_attempts: 64,
            base_delay: Duration::from_micros(50),
            max_delay: Duration::from_millis(5),
            deadline: None,
        }
    }

    /// Fail on the first conflict
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            deadline: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deterministic part of the delay after `attempt` failures:
    /// `base * 2^(attempt-1)`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(20);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Backoff state for one `atomically` call
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    failures: u32,
}

impl<'a> Backoff<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Backoff {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether another attempt is allowed
    pub fn can_retry(&self) -> bool {
        self.failures < self.policy.max_attempts
    }

    /// Register a failure and return the delay to wait before retrying.
    /// The capped delay is reduced by a random jitter of up to half of it,
    /// so retriers stay spread out even once they all sit at `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        self.failures += 1;
        let delay = self.policy.delay_for(self.failures);
        if delay.is_zero() {
            return delay;
        }
        let jitter_max = u64::try_from(delay.as_nanos() / 2).unwrap_or(u64::MAX);
        let jitter = Duration::from_nanos(rand::thread_rng().gen_range(0..=jitter_max));
        delay.saturating_sub(jitter)
    }
}

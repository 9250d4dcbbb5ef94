//! Retry schedule

use std::time::Duration;

/// Attempt budget and exponential delay schedule for one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Wait after the first failed attempt; doubles after every further failure
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        exponential(self.base_delay, attempt.saturating_sub(1), self.max_delay)
    }

    pub const fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// `base * 2^exponent`, saturating at `cap`.
pub fn exponential(base: Duration, exponent: u32, cap: Duration) -> Duration {
    let factor = 2_u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles_from_five_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after(2), Duration::from_secs(10));
        assert_eq!(policy.delay_after(3), Duration::from_secs(20));
    }

    #[test]
    fn retry_budget_counts_the_first_attempt() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry_after(1));
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
    }

    #[test]
    fn exponential_saturates_at_cap() {
        let cap = Duration::from_secs(30);
        assert_eq!(exponential(Duration::from_secs(1), 4, cap), Duration::from_secs(16));
        assert_eq!(exponential(Duration::from_secs(1), 5, cap), cap);
        assert_eq!(exponential(Duration::from_secs(1), 64, cap), cap);
    }
}

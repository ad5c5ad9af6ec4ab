//! Retry policy: decides how often a failed task is retried and the backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for failed tasks.
///
/// delay = base_delay * multiplier^(attempts - 1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts a task gets, including the first one.
    pub max_attempts: u32,

    /// Base delay for the first retry.
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Has a task with `attempts` claims used up its budget?
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before the next retry, `attempts` being the claims made so far
    /// (1-indexed). attempts=0 uses the base delay.
    ///
    /// With base_delay=2s, multiplier=2.0: 2s, 4s, 8s, 16s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(u32::MAX), Duration::MAX);
    }

    #[test]
    fn budget_is_inclusive_of_first_attempt() {
        let policy = RetryPolicy::no_retry();
        assert!(policy.exhausted(1));
        assert!(!RetryPolicy::default().exhausted(2));
        assert!(RetryPolicy::default().exhausted(3));
    }
}

//! Reconnect policy for managed devices.
//!
//! A failed connection attempt is retried while the device's attempt counter
//! is below the profile's limit. The wait grows linearly with the number of
//! attempts already made:
//!
//! ```text
//! delay = base_delay * (attempts + 1)
//! ```
//!
//! With the detector defaults (5 attempts, 5 s base) the waits after the
//! first four failures are 10 s, 15 s, 20 s and 25 s; the fifth failure
//! exhausts the budget and the device is blacklisted.

use std::time::Duration;

use crate::error::{Error, Result};

/// Linear-backoff reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts allowed before the device is blacklisted.
    pub max_attempts: u32,
    /// Base delay multiplied by the next attempt number.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of attempts allowed.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Wait before the next attempt, given `attempts` already made.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempts.saturating_add(1))
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_reconnect_attempts must be > 0"));
        }
        if self.base_delay.is_zero() {
            return Err(Error::invalid_config("reconnect_delay must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(5));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_linear_backoff() {
        let policy = ReconnectPolicy::new().base_delay(Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(25_000));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = ReconnectPolicy::new().base_delay(Duration::MAX);
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::MAX);
    }

    #[test]
    fn test_should_retry() {
        let policy = ReconnectPolicy::new().max_attempts(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(ReconnectPolicy::new().max_attempts(0).validate().is_err());
        let err = ReconnectPolicy::new()
            .base_delay(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("reconnect_delay"));
    }
}

use crate::domain::failure::CallableFailure;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many times, and how far apart, a failed run is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Constant delay between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Policy allowing `max_attempts` attempts spaced by `delay`
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self, CoreError> {
        if max_attempts == 0 {
            return Err(CoreError::ConfigurationError(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            delay,
        })
    }

    /// Policy from a retry count: `retries` re-attempts after the first one
    pub fn from_retries(retries: u32, delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            delay,
        }
    }

    /// A single attempt, never retried
    pub fn no_retries() -> Self {
        Self::from_retries(0, Duration::ZERO)
    }

    /// Number of re-attempts after the first one
    pub fn retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retries()
    }
}

/// Outcome of consulting the retry controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether to attempt again
    pub retry: bool,
    /// How long to wait before the next attempt
    pub delay: Duration,
}

/// Decides whether a failed attempt is re-attempted
pub struct RetryController;

impl RetryController {
    /// Retry while `attempt < policy.max_attempts`.
    ///
    /// The decision only depends on the attempt and the policy; the failure
    /// content is not inspected.
    pub fn should_retry(
        attempt: u32,
        policy: &RetryPolicy,
        _failure: &CallableFailure,
    ) -> RetryDecision {
        if attempt < policy.max_attempts {
            RetryDecision {
                retry: true,
                delay: policy.delay,
            }
        } else {
            RetryDecision {
                retry: false,
                delay: Duration::ZERO,
            }
        }
    }
}

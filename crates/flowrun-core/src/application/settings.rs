use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide defaults applied to callables that do not set their own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Retries for callables that do not declare any
    #[serde(default)]
    pub default_retries: u32,

    /// Delay between attempts, in seconds
    #[serde(default)]
    pub default_retry_delay_seconds: f64,

    /// Per-attempt timeout, in seconds; `None` or `0` means no timeout
    #[serde(default)]
    pub default_timeout_seconds: Option<f64>,

    /// Record a failed run when parameter validation rejects a call
    #[serde(default)]
    pub record_invalid_runs: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_retries: 0,
            default_retry_delay_seconds: 0.0,
            default_timeout_seconds: None,
            record_invalid_runs: false,
        }
    }
}

impl EngineSettings {
    /// Check that every duration setting is representable
    pub fn validate(&self) -> Result<(), CoreError> {
        seconds_to_duration("default_retry_delay_seconds", self.default_retry_delay_seconds)?;
        if let Some(timeout) = self.default_timeout_seconds {
            seconds_to_duration("default_timeout_seconds", timeout)?;
        }
        Ok(())
    }

    /// Default delay between attempts
    pub fn default_retry_delay(&self) -> Duration {
        seconds_to_duration("default_retry_delay_seconds", self.default_retry_delay_seconds)
            .unwrap_or(Duration::ZERO)
    }

    /// Default per-attempt timeout
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_seconds
            .and_then(|secs| seconds_to_duration("default_timeout_seconds", secs).ok())
            .filter(|timeout| !timeout.is_zero())
    }
}

/// Convert a user supplied number of seconds to a `Duration`
pub(crate) fn seconds_to_duration(field: &str, seconds: f64) -> Result<Duration, CoreError> {
    Duration::try_from_secs_f64(seconds).map_err(|_| {
        CoreError::ConfigurationError(format!(
            "{} must be a finite, non-negative number of seconds, got {}",
            field, seconds
        ))
    })
}

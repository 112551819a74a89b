use thiserror::Error;

use crate::domain::parameters::ValidationError;
use crate::domain::run::RunState;
use crate::domain::failure::RunFailedError;

/// Core error type for recorder, registration and configuration failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Run not found
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// A transition that the run state machine does not allow
    #[error("Invalid transition for run {run_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Run the transition was issued for
        run_id: String,
        /// Current state of the run
        from: RunState,
        /// Requested state
        to: RunState,
    },

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Log sink error
    #[error("Log sink error: {0}")]
    LogSinkError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Callable or run name rejected at registration
    #[error("Invalid name '{name}': {reason}")]
    InvalidName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Timer error
    #[error("Timer error: {0}")]
    TimerError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

/// Error returned to the caller of a managed run
#[derive(Error, Debug)]
pub enum RunError {
    /// Parameters were rejected before the run started
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Every attempt failed
    #[error(transparent)]
    Failed(#[from] RunFailedError),

    /// The recorder, log sink or timer failed while orchestrating the run
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl RunError {
    /// The validation error, if the run was rejected before starting
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            RunError::Validation(err) => Some(err),
            _ => None,
        }
    }

    /// The exhausted-retries error, if the run failed
    pub fn as_failed(&self) -> Option<&RunFailedError> {
        match self {
            RunError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

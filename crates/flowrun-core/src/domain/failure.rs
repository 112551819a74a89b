//! Failures raised while executing a managed callable, and their recorded form.

use crate::domain::run::RunId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// What kind of failure ended an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The callable returned an error
    Raised,
    /// The callable exceeded its time budget
    TimedOut,
    /// The callable panicked
    Panicked,
    /// Parameters were rejected before the callable ran
    Validation,
    /// The run was abandoned before it reached a terminal state
    Cancelled,
    /// Recording or waiting failed inside the engine
    Engine,
}

/// Serializable failure details stored with transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Failure category
    pub kind: FailureKind,
    /// Rendered failure message
    pub message: String,
}

impl FailureRecord {
    /// Create a failure record
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A failure raised by one attempt of a managed callable.
///
/// Timeouts are callable failures too and go through the retry path.
#[derive(Debug, Clone, Error)]
pub enum CallableFailure {
    /// The callable returned an error
    #[error("{0:#}")]
    Raised(Arc<anyhow::Error>),

    /// The attempt was abandoned after its time budget
    #[error("exceeded timeout of {} seconds", .0.as_secs_f64())]
    TimedOut(Duration),

    /// The callable panicked
    #[error("callable panicked: {0}")]
    Panicked(String),
}

impl CallableFailure {
    /// Wrap an error returned by a callable
    pub fn raised(err: impl Into<anyhow::Error>) -> Self {
        CallableFailure::Raised(Arc::new(err.into()))
    }

    /// Failure category
    pub fn kind(&self) -> FailureKind {
        match self {
            CallableFailure::Raised(_) => FailureKind::Raised,
            CallableFailure::TimedOut(_) => FailureKind::TimedOut,
            CallableFailure::Panicked(_) => FailureKind::Panicked,
        }
    }

    /// Whether this failure is an enforced timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallableFailure::TimedOut(_))
    }

    /// Downcast the error returned by the callable
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            CallableFailure::Raised(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Recorded form of this failure
    pub fn to_record(&self) -> FailureRecord {
        FailureRecord::new(self.kind(), self.to_string())
    }
}

/// Failure of one specific attempt
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// What went wrong
    pub failure: CallableFailure,
}

/// Raised to the caller once every attempt of a run has failed
#[derive(Debug, Clone, Error)]
#[error("run '{run_name}' ({run_id}) failed after {attempts} attempt(s): {last_failure}")]
pub struct RunFailedError {
    /// Failed run
    pub run_id: RunId,
    /// Name of the failed run
    pub run_name: String,
    /// Number of attempts made
    pub attempts: u32,
    /// Failure of the final attempt
    #[source]
    pub last_failure: CallableFailure,
    /// Failures of every attempt, in order
    pub history: Vec<AttemptFailure>,
}

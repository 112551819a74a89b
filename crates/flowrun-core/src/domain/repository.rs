//! Repository traits for the run orchestration core
//!
//! This module defines the storage collaborators used by the execution
//! service. External crates implement these traits to provide different
//! persistence mechanisms.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::run::{Run, RunId, RunKind, RunState, StateTransition, TransitionMetadata};
use crate::{CoreError, LogLevel, Parameters};

/// Filters for listing runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    /// Only runs of this kind
    pub kind: Option<RunKind>,
    /// Only runs currently in this state
    pub state: Option<RunState>,
    /// Only children of this run
    pub parent_id: Option<RunId>,
    /// Only runs of this callable
    pub callable_name: Option<String>,
}

impl RunFilter {
    /// Whether `run` passes the filter
    pub fn matches(&self, run: &Run) -> bool {
        self.kind.map_or(true, |kind| run.kind == kind)
            && self.state.map_or(true, |state| run.state == state)
            && self
                .parent_id
                .as_ref()
                .map_or(true, |parent| run.parent_id.as_ref() == Some(parent))
            && self
                .callable_name
                .as_ref()
                .map_or(true, |name| &run.callable_name == name)
    }
}

/// Persists runs and their state history.
///
/// The recorder is the sole writer of transitions. Implementations must
/// append transitions of a single run in the order they are issued, reject
/// transitions the state machine does not allow, and never rewrite history.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    /// Create a run in `Scheduled`, recording its creation transition
    async fn create_run(
        &self,
        kind: RunKind,
        name: &str,
        callable_name: &str,
        parameters: &Parameters,
        parent_id: Option<&RunId>,
    ) -> Result<RunId, CoreError>;

    /// Append a transition to the run's history
    async fn transition(
        &self,
        run_id: &RunId,
        new_state: RunState,
        metadata: TransitionMetadata,
    ) -> Result<StateTransition, CoreError>;

    /// Current snapshot of a run
    async fn get_run(&self, run_id: &RunId) -> Result<Run, CoreError>;

    /// Every transition of a run, ordered by sequence
    async fn history(&self, run_id: &RunId) -> Result<Vec<StateTransition>, CoreError>;

    /// Runs matching the filter, oldest first
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, CoreError>;
}

/// A log line emitted by the engine or by a callable, keyed by run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Run the entry belongs to
    pub run_id: RunId,
    /// Severity
    pub level: LogLevel,
    /// Log message
    pub message: String,
    /// When the entry was emitted
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Create an entry stamped with the current time
    pub fn now(run_id: RunId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            run_id,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only log stream keyed by run
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append an entry
    async fn append(&self, entry: LogEntry) -> Result<(), CoreError>;

    /// Entries of a run, in the order they were appended
    async fn read_logs(&self, run_id: &RunId) -> Result<Vec<LogEntry>, CoreError>;
}

/// Suspends a run until its next attempt is due.
///
/// Implementations must only suspend the calling run, never the runtime.
#[async_trait]
pub trait RetryTimer: Send + Sync {
    /// Wait `delay` before `run_id` attempts again
    async fn wait(&self, run_id: &RunId, delay: Duration) -> Result<(), CoreError>;
}

/// Retry timer backed by the tokio timer wheel
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioRetryTimer;

#[async_trait]
impl RetryTimer for TokioRetryTimer {
    async fn wait(&self, _run_id: &RunId, delay: Duration) -> Result<(), CoreError> {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

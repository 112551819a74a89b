//! Run counters recorded through the `metrics` facade.
//!
//! Without an installed recorder the macros are no-ops, so the handler also
//! keeps process-local totals that can be read with [`RunMetricsHandler::snapshot`].

use async_trait::async_trait;
use metrics::increment_counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flowrun_core::{CoreError, FailureKind, RunEvent, RunEventHandler, RunState};

/// Totals observed by a [`RunMetricsHandler`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMetricsSnapshot {
    /// Every recorded transition, creation included
    pub transitions: u64,
    /// Runs that reached Completed
    pub completed: u64,
    /// Runs that reached Failed
    pub failed: u64,
    /// Attempts that were scheduled for a retry
    pub retries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    transitions: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// Event handler counting run transitions
#[derive(Debug, Clone, Default)]
pub struct RunMetricsHandler {
    counters: Arc<Counters>,
}

impl RunMetricsHandler {
    /// Create a handler with zeroed totals
    pub fn new() -> Self {
        Self::default()
    }

    /// Current totals
    pub fn snapshot(&self) -> RunMetricsSnapshot {
        RunMetricsSnapshot {
            transitions: self.counters.transitions.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }
}

fn failure_label(kind: Option<FailureKind>) -> &'static str {
    match kind {
        Some(FailureKind::Raised) => "raised",
        Some(FailureKind::TimedOut) => "timed_out",
        Some(FailureKind::Panicked) => "panicked",
        Some(FailureKind::Validation) => "validation",
        Some(FailureKind::Cancelled) => "cancelled",
        Some(FailureKind::Engine) => "engine",
        None => "unknown",
    }
}

#[async_trait]
impl RunEventHandler for RunMetricsHandler {
    async fn handle_event(&self, event: &RunEvent) -> Result<(), CoreError> {
        let kind = event.kind.as_str();
        let state = event.transition.to.as_str();

        self.counters.transitions.fetch_add(1, Ordering::Relaxed);
        increment_counter!("flowrun_run_transitions_total", "kind" => kind, "state" => state);

        let failure = event.transition.failure.as_ref().map(|f| f.kind);
        match event.transition.to {
            RunState::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                increment_counter!("flowrun_runs_completed_total", "kind" => kind);
            }
            RunState::Failed => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                increment_counter!(
                    "flowrun_runs_failed_total",
                    "kind" => kind,
                    "reason" => failure_label(failure)
                );
            }
            RunState::Retrying => {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                increment_counter!(
                    "flowrun_run_retries_total",
                    "kind" => kind,
                    "reason" => failure_label(failure)
                );
            }
            RunState::Scheduled | RunState::Running => {}
        }

        Ok(())
    }
}

//! In-memory state store implementation for flowrun
//!
//! This crate provides in-memory implementations of the recorder and log
//! sink interfaces defined in the flowrun-core crate. It is primarily useful
//! for development, testing, and simple deployments where persistence is not
//! required.

use std::sync::Arc;

use flowrun_core::{LogSink, RunRecorder};

pub mod repositories;
pub use repositories::{InMemoryLogSink, InMemoryRunRecorder};

use repositories::RunStore;

/// Provider for in-memory state store repositories
pub struct InMemoryStateStoreProvider {
    // Shared storage for runs and their histories
    runs: Arc<RunStore>,

    // Shared storage for run logs
    logs: Arc<InMemoryLogSink>,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RunStore::default()),
            logs: Arc::new(InMemoryLogSink::new()),
        }
    }

    /// Create the recorder and log sink used by the execution service.
    ///
    /// Recorders created by the same provider share storage.
    pub fn create_repositories(&self) -> (Arc<dyn RunRecorder>, Arc<dyn LogSink>) {
        let recorder = Arc::new(InMemoryRunRecorder::with_store(self.runs.clone()));
        (recorder, self.logs.clone())
    }
}

impl Default for InMemoryStateStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}

//! Retry timer that records requested delays instead of sleeping.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use flowrun_core::{CoreError, RetryTimer, RunId};

/// Records every wait and returns immediately.
///
/// Clones share the same record, so a test can keep one handle and give the
/// other to the execution service.
#[derive(Debug, Clone, Default)]
pub struct RecordingRetryTimer {
    waits: Arc<Mutex<Vec<(RunId, Duration)>>>,
}

impl RecordingRetryTimer {
    /// Create a timer with an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Every requested delay, in request order
    pub fn delays(&self) -> Vec<Duration> {
        self.waits.lock().iter().map(|(_, delay)| *delay).collect()
    }

    /// Delays requested for `run_id`
    pub fn delays_for(&self, run_id: &RunId) -> Vec<Duration> {
        self.waits
            .lock()
            .iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, delay)| *delay)
            .collect()
    }

    /// Total time the runs would have slept
    pub fn total_delay(&self) -> Duration {
        self.waits.lock().iter().map(|(_, delay)| *delay).sum()
    }
}

#[async_trait]
impl RetryTimer for RecordingRetryTimer {
    async fn wait(&self, run_id: &RunId, delay: Duration) -> Result<(), CoreError> {
        self.waits.lock().push((run_id.clone(), delay));
        Ok(())
    }
}

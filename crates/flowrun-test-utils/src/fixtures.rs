//! Ready-made execution services backed by the in-memory store.

use std::sync::Arc;

use flowrun_core::{
    BroadcastEventHandler, CoreError, EngineSettings, ExecutionService, LogEntry, RunEvent, RunId,
    StateTransition,
};
use flowrun_state_inmemory::InMemoryStateStoreProvider;
use tokio::sync::broadcast;

/// Execution service wired to in-memory storage and a [`RecordingRetryTimer`]
///
/// [`RecordingRetryTimer`]: crate::RecordingRetryTimer
#[derive(Clone)]
pub struct TestEngine {
    service: ExecutionService,
    timer: crate::RecordingRetryTimer,
    events: BroadcastEventHandler,
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEngine {
    /// Engine with default settings
    pub fn new() -> Self {
        let (recorder, logs) = InMemoryStateStoreProvider::new().create_repositories();
        let timer = crate::RecordingRetryTimer::new();
        let events = BroadcastEventHandler::new(1024);
        let service = ExecutionService::new(recorder, logs)
            .with_retry_timer(Arc::new(timer.clone()))
            .with_event_handler(Arc::new(events.clone()));

        Self {
            service,
            timer,
            events,
        }
    }

    /// Engine with custom settings
    pub fn with_settings(settings: EngineSettings) -> Result<Self, CoreError> {
        let engine = Self::new();
        Ok(Self {
            service: engine.service.with_settings(settings)?,
            ..engine
        })
    }

    /// The execution service
    pub fn service(&self) -> &ExecutionService {
        &self.service
    }

    /// The retry timer the service waits on
    pub fn timer(&self) -> &crate::RecordingRetryTimer {
        &self.timer
    }

    /// Watch events recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Recorded history of `run_id`
    pub async fn history(&self, run_id: &RunId) -> Result<Vec<StateTransition>, CoreError> {
        self.service.recorder().history(run_id).await
    }

    /// Log entries of `run_id`
    pub async fn logs(&self, run_id: &RunId) -> Result<Vec<LogEntry>, CoreError> {
        self.service.log_sink().read_logs(run_id).await
    }

    /// Log messages of `run_id`
    pub async fn log_messages(&self, run_id: &RunId) -> Result<Vec<String>, CoreError> {
        Ok(self
            .logs(run_id)
            .await?
            .into_iter()
            .map(|entry| entry.message)
            .collect())
    }
}

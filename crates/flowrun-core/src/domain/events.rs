use crate::domain::run::{RunKind, StateTransition};
use crate::CoreError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event emitted after a transition has been recorded
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    /// Kind of the run
    pub kind: RunKind,
    /// Name of the run
    pub run_name: String,
    /// Name of the callable that produced the run
    pub callable_name: String,
    /// The recorded transition
    pub transition: StateTransition,
}

impl RunEvent {
    /// Dotted event name, e.g. `flow_run.completed`
    pub fn event_type(&self) -> String {
        format!(
            "{}_run.{}",
            self.kind.as_str(),
            self.transition.to.as_str().to_ascii_lowercase()
        )
    }
}

/// Handler for run events
#[async_trait]
pub trait RunEventHandler: Send + Sync {
    /// Handle a run event
    async fn handle_event(&self, event: &RunEvent) -> Result<(), CoreError>;
}

/// Handler that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventHandler;

#[async_trait]
impl RunEventHandler for NoopEventHandler {
    async fn handle_event(&self, _event: &RunEvent) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Fans run events out to live watchers
#[derive(Debug, Clone)]
pub struct BroadcastEventHandler {
    sender: broadcast::Sender<RunEvent>,
}

impl BroadcastEventHandler {
    /// Create a handler buffering up to `capacity` events per watcher
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Watch events recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl RunEventHandler for BroadcastEventHandler {
    async fn handle_event(&self, event: &RunEvent) -> Result<(), CoreError> {
        // No watchers is not an error
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// Forwards each event to several handlers in order
#[derive(Clone, Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Arc<dyn RunEventHandler>>,
}

impl CompositeEventHandler {
    /// Create an empty composite handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler
    pub fn with(mut self, handler: Arc<dyn RunEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }
}

#[async_trait]
impl RunEventHandler for CompositeEventHandler {
    async fn handle_event(&self, event: &RunEvent) -> Result<(), CoreError> {
        for handler in &self.handlers {
            handler.handle_event(event).await?;
        }
        Ok(())
    }
}

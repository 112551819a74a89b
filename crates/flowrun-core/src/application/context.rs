use crate::application::execution::{CompletedRun, ExecutionService};
use crate::application::managed::ManagedFn;
use crate::domain::repository::LogEntry;
use crate::domain::run::{RunId, RunKind};
use crate::{CoreError, LogLevel, Parameters, RunError};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Handle given to a callable body for the attempt it is running in.
///
/// The context is passed explicitly; there is no ambient "current run".
#[derive(Clone)]
pub struct RunContext {
    run_id: RunId,
    run_name: String,
    kind: RunKind,
    attempt: u32,
    parameters: Arc<Parameters>,
    log_prints: bool,
    service: ExecutionService,
}

impl RunContext {
    pub(crate) fn new(
        run_id: RunId,
        run_name: String,
        kind: RunKind,
        attempt: u32,
        parameters: Arc<Parameters>,
        log_prints: bool,
        service: ExecutionService,
    ) -> Self {
        Self {
            run_id,
            run_name,
            kind,
            attempt,
            parameters,
            log_prints,
            service,
        }
    }

    /// Id of the current run
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Name of the current run
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    /// Flow or task
    pub fn kind(&self) -> RunKind {
        self.kind
    }

    /// Current attempt, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Validated parameters of the run
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Deserialize the parameter `name`
    pub fn parameter<T: DeserializeOwned>(&self, name: &str) -> Result<T, CoreError> {
        let value = self.parameters.get(name).ok_or_else(|| {
            CoreError::Other(format!("run '{}' has no parameter '{}'", self.run_name, name))
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Append a line to the run's log stream
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<(), CoreError> {
        self.service
            .log_sink()
            .append(LogEntry::now(self.run_id.clone(), level, message))
            .await
    }

    /// Print a message: to the run's log at INFO with `log_prints`, to stdout otherwise
    pub async fn print(&self, message: impl Into<String>) -> Result<(), CoreError> {
        let message = message.into();
        if self.log_prints {
            self.log(LogLevel::Info, message).await
        } else {
            println!("{}", message);
            Ok(())
        }
    }

    /// Run `managed` as a child of the current run and wait for its result
    pub async fn run_task(
        &self,
        managed: &ManagedFn,
        raw_args: Parameters,
    ) -> Result<CompletedRun, RunError> {
        self.service
            .run_with_parent(managed, raw_args, Some(&self.run_id))
            .await
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("run_name", &self.run_name)
            .field("kind", &self.kind)
            .field("attempt", &self.attempt)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

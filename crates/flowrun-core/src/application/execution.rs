//! The execution service turns a managed callable into a managed run.
//!
//! For every call it validates the raw arguments, records the run, executes
//! the body attempt by attempt (each attempt in its own tokio task, bounded
//! by the callable's timeout), consults the retry controller on failure and
//! records the final state before returning to the caller.

use crate::application::context::RunContext;
use crate::application::managed::ManagedFn;
use crate::application::settings::EngineSettings;
use crate::domain::events::{NoopEventHandler, RunEvent, RunEventHandler};
use crate::domain::failure::{
    AttemptFailure, CallableFailure, FailureKind, FailureRecord, RunFailedError,
};
use crate::domain::parameters::{ParameterValidator, ValidationError};
use crate::domain::repository::{LogEntry, LogSink, RetryTimer, RunRecorder, TokioRetryTimer};
use crate::domain::retry::RetryController;
use crate::domain::run::{generate_run_name, RunId, RunState, StateTransition, TransitionMetadata};
use crate::{CoreError, LogLevel, Parameters, RunError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State name recorded for runs waiting for their next attempt
pub const AWAITING_RETRY: &str = "AwaitingRetry";

/// State name recorded for runs that exceeded their timeout
pub const TIMED_OUT: &str = "TimedOut";

/// State name recorded for runs dropped before they finished
pub const CANCELLED: &str = "Cancelled";

/// Successful outcome of a managed run
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRun {
    /// Id of the run
    pub run_id: RunId,
    /// Name of the run
    pub name: String,
    /// Number of attempts it took
    pub attempts: u32,
    /// Value returned by the body
    pub value: Value,
}

impl CompletedRun {
    /// Deserialize the returned value
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// A run started with [`ExecutionService::submit`]
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    name: String,
    handle: JoinHandle<Result<CompletedRun, RunError>>,
}

impl RunHandle {
    /// Id of the run, usable while it is in flight
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Name of the run
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the run has finished
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run to finish
    pub async fn join(self) -> Result<CompletedRun, RunError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(RunError::Core(CoreError::Other(format!(
                "run {} did not finish: {}",
                self.run_id, err
            )))),
        }
    }
}

/// A run that passed validation and was recorded
struct PreparedRun {
    run_id: RunId,
    name: String,
    parameters: Arc<Parameters>,
}

/// Execution wrapper for managed callables
#[derive(Clone)]
pub struct ExecutionService {
    /// Recorder for runs and transitions
    recorder: Arc<dyn RunRecorder>,

    /// Log stream keyed by run
    log_sink: Arc<dyn LogSink>,

    /// Timer used between attempts
    retry_timer: Arc<dyn RetryTimer>,

    /// Receives every recorded transition
    event_handler: Arc<dyn RunEventHandler>,

    /// Engine defaults
    settings: EngineSettings,
}

impl ExecutionService {
    /// Create a service with the tokio retry timer, no event handler and
    /// default settings
    pub fn new(recorder: Arc<dyn RunRecorder>, log_sink: Arc<dyn LogSink>) -> Self {
        Self {
            recorder,
            log_sink,
            retry_timer: Arc::new(TokioRetryTimer),
            event_handler: Arc::new(NoopEventHandler),
            settings: EngineSettings::default(),
        }
    }

    /// Replace the retry timer
    pub fn with_retry_timer(mut self, retry_timer: Arc<dyn RetryTimer>) -> Self {
        self.retry_timer = retry_timer;
        self
    }

    /// Replace the event handler
    pub fn with_event_handler(mut self, event_handler: Arc<dyn RunEventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Replace the engine settings, rejecting durations that cannot be
    /// represented
    pub fn with_settings(mut self, settings: EngineSettings) -> Result<Self, CoreError> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    /// The run recorder
    pub fn recorder(&self) -> &Arc<dyn RunRecorder> {
        &self.recorder
    }

    /// The log sink
    pub fn log_sink(&self) -> &Arc<dyn LogSink> {
        &self.log_sink
    }

    /// The engine settings
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run `managed` with `raw_args` and wait for the outcome
    pub async fn run(
        &self,
        managed: &ManagedFn,
        raw_args: Parameters,
    ) -> Result<CompletedRun, RunError> {
        self.run_with_parent(managed, raw_args, None).await
    }

    /// Start `managed` in the background.
    ///
    /// Validation and run creation happen before this returns, so the handle
    /// already carries the id of the recorded run.
    pub async fn submit(
        &self,
        managed: &ManagedFn,
        raw_args: Parameters,
    ) -> Result<RunHandle, RunError> {
        let prepared = self.prepare(managed, raw_args, None).await?;
        let run_id = prepared.run_id.clone();
        let name = prepared.name.clone();

        let service = self.clone();
        let managed = managed.clone();
        let handle = tokio::spawn(async move { service.drive(&managed, prepared).await });

        Ok(RunHandle {
            run_id,
            name,
            handle,
        })
    }

    pub(crate) async fn run_with_parent(
        &self,
        managed: &ManagedFn,
        raw_args: Parameters,
        parent_id: Option<&RunId>,
    ) -> Result<CompletedRun, RunError> {
        let prepared = self.prepare(managed, raw_args, parent_id).await?;
        self.drive(managed, prepared).await
    }

    /// Validate the arguments and record the run
    async fn prepare(
        &self,
        managed: &ManagedFn,
        raw_args: Parameters,
        parent_id: Option<&RunId>,
    ) -> Result<PreparedRun, RunError> {
        let bound = if managed.validates_parameters() {
            ParameterValidator::validate(&raw_args, managed.parameters())
        } else {
            ParameterValidator::apply_defaults(&raw_args, managed.parameters())
        };

        let parameters = match bound {
            Ok(parameters) => parameters,
            Err(err) => {
                warn!(callable = %managed.name(), error = %err, "Rejected run parameters");
                if self.settings.record_invalid_runs {
                    self.record_rejected(managed, &raw_args, parent_id, &err)
                        .await?;
                }
                return Err(RunError::Validation(err));
            }
        };

        // Rendered once per call, retries keep the name
        let name = managed.render_run_name(&parameters);
        let run_id = self
            .recorder
            .create_run(managed.kind(), &name, managed.name(), &parameters, parent_id)
            .await?;

        if let Some(created) = self.recorder.history(&run_id).await?.into_iter().next() {
            self.emit(managed, &name, created).await;
        }

        info!(
            run_id = %run_id,
            kind = %managed.kind(),
            callable = %managed.name(),
            "Created {} run '{}'",
            managed.kind(),
            name
        );
        self.log(
            &run_id,
            LogLevel::Info,
            format!(
                "Created {} run '{}' for {} '{}'",
                managed.kind(),
                name,
                managed.kind(),
                managed.name()
            ),
        )
        .await;

        Ok(PreparedRun {
            run_id,
            name,
            parameters: Arc::new(parameters),
        })
    }

    async fn record_rejected(
        &self,
        managed: &ManagedFn,
        raw_args: &Parameters,
        parent_id: Option<&RunId>,
        err: &ValidationError,
    ) -> Result<(), CoreError> {
        let name = generate_run_name();
        let run_id = self
            .recorder
            .create_run(managed.kind(), &name, managed.name(), raw_args, parent_id)
            .await?;

        let failure = FailureRecord::new(FailureKind::Validation, err.to_string());
        self.transition(
            managed,
            &name,
            &run_id,
            RunState::Failed,
            TransitionMetadata::attempt(1)
                .with_message(err.to_string())
                .with_failure(failure),
        )
        .await?;
        self.log(&run_id, LogLevel::Error, err.to_string()).await;
        Ok(())
    }

    /// Execute attempts until one succeeds or the retry policy is exhausted.
    ///
    /// The run always ends in a terminal state: engine errors record a
    /// `Failed` transition before they propagate, and dropping the returned
    /// future records `Cancelled`.
    async fn drive(
        &self,
        managed: &ManagedFn,
        prepared: PreparedRun,
    ) -> Result<CompletedRun, RunError> {
        let mut finalizer = RunFinalizer::new(self.clone(), managed.clone(), &prepared);
        let outcome = self.attempt_loop(managed, prepared, &mut finalizer).await;

        if let Err(RunError::Core(err)) = &outcome {
            if finalizer.armed {
                let failure = FailureRecord::new(FailureKind::Engine, err.to_string());
                if let Err(e) = self
                    .abandon(
                        managed,
                        &finalizer.name,
                        &finalizer.run_id,
                        finalizer.attempt,
                        None,
                        failure,
                    )
                    .await
                {
                    error!(run_id = %finalizer.run_id, error = %e, "Could not record failed run");
                }
            }
        }

        finalizer.disarm();
        outcome
    }

    async fn attempt_loop(
        &self,
        managed: &ManagedFn,
        prepared: PreparedRun,
        finalizer: &mut RunFinalizer,
    ) -> Result<CompletedRun, RunError> {
        let PreparedRun {
            run_id,
            name,
            parameters,
        } = prepared;
        let policy = managed.retry_policy(&self.settings);
        let timeout = managed.timeout(&self.settings);
        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut attempt = 1;

        loop {
            finalizer.attempt = attempt;
            self.transition(
                managed,
                &name,
                &run_id,
                RunState::Running,
                TransitionMetadata::attempt(attempt),
            )
            .await?;
            debug!(run_id = %run_id, attempt, max_attempts = policy.max_attempts, "Starting attempt");

            let context = RunContext::new(
                run_id.clone(),
                name.clone(),
                managed.kind(),
                attempt,
                parameters.clone(),
                managed.log_prints(),
                self.clone(),
            );

            let failure = match self.execute_attempt(managed, context, timeout).await {
                Ok(value) => {
                    self.transition(
                        managed,
                        &name,
                        &run_id,
                        RunState::Completed,
                        TransitionMetadata::attempt(attempt).with_result(value.clone()),
                    )
                    .await?;
                    finalizer.disarm();
                    info!(run_id = %run_id, attempt, "Finished in state Completed");
                    self.log(&run_id, LogLevel::Info, "Finished in state Completed()")
                        .await;

                    return Ok(CompletedRun {
                        run_id,
                        name,
                        attempts: attempt,
                        value,
                    });
                }
                Err(failure) => failure,
            };

            self.log(
                &run_id,
                LogLevel::Error,
                format!("Attempt {} failed: {}", attempt, failure),
            )
            .await;
            failures.push(AttemptFailure {
                attempt,
                failure: failure.clone(),
            });

            let decision = RetryController::should_retry(attempt, &policy, &failure);
            if decision.retry {
                self.transition(
                    managed,
                    &name,
                    &run_id,
                    RunState::Retrying,
                    TransitionMetadata::attempt(attempt)
                        .with_state_name(AWAITING_RETRY)
                        .with_message(failure.to_string())
                        .with_failure(failure.to_record())
                        .with_retry_delay(decision.delay),
                )
                .await?;
                warn!(
                    run_id = %run_id,
                    attempt,
                    delay_ms = decision.delay.as_millis() as u64,
                    error = %failure,
                    "Attempt failed, retrying"
                );
                self.log(
                    &run_id,
                    LogLevel::Info,
                    format!(
                        "Retry {}/{} will start {}",
                        attempt,
                        policy.retries(),
                        describe_delay(decision.delay)
                    ),
                )
                .await;

                self.retry_timer.wait(&run_id, decision.delay).await?;
                attempt += 1;
                continue;
            }

            let mut metadata = TransitionMetadata::attempt(attempt)
                .with_message(failure.to_string())
                .with_failure(failure.to_record());
            if failure.is_timeout() {
                metadata = metadata.with_state_name(TIMED_OUT);
            }
            self.transition(managed, &name, &run_id, RunState::Failed, metadata)
                .await?;
            finalizer.disarm();
            error!(run_id = %run_id, attempts = attempt, error = %failure, "Run failed");
            self.log(
                &run_id,
                LogLevel::Error,
                format!("Finished in state Failed after {} attempt(s): {}", attempt, failure),
            )
            .await;

            return Err(RunError::Failed(RunFailedError {
                run_id,
                run_name: name,
                attempts: attempt,
                last_failure: failure,
                history: failures,
            }));
        }
    }

    /// Run one attempt in its own task, bounded by `timeout`.
    ///
    /// The task is aborted when the attempt is abandoned, whether by the
    /// timeout or by dropping this future.
    async fn execute_attempt(
        &self,
        managed: &ManagedFn,
        context: RunContext,
        timeout: Option<Duration>,
    ) -> Result<Value, CallableFailure> {
        let mut task = AttemptTask(tokio::spawn(managed.invoke(context)));

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task.0).await {
                Ok(joined) => joined,
                Err(_) => return Err(CallableFailure::TimedOut(limit)),
            },
            None => (&mut task.0).await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(CallableFailure::raised(err)),
            Err(err) if err.is_panic() => {
                Err(CallableFailure::Panicked(panic_message(err.into_panic())))
            }
            Err(err) => Err(CallableFailure::raised(anyhow::anyhow!(
                "attempt was cancelled: {}",
                err
            ))),
        }
    }

    /// Move an unfinished run straight to `Failed`
    async fn abandon(
        &self,
        managed: &ManagedFn,
        run_name: &str,
        run_id: &RunId,
        attempt: u32,
        state_name: Option<&str>,
        failure: FailureRecord,
    ) -> Result<StateTransition, CoreError> {
        let message = failure.message.clone();
        let mut metadata = TransitionMetadata::attempt(attempt)
            .with_message(message.clone())
            .with_failure(failure);
        if let Some(state_name) = state_name {
            metadata = metadata.with_state_name(state_name);
        }
        let transition = self
            .transition(managed, run_name, run_id, RunState::Failed, metadata)
            .await?;
        error!(run_id = %run_id, attempt, error = %message, "Run abandoned");
        self.log(run_id, LogLevel::Error, format!("Finished in state Failed: {}", message))
            .await;
        Ok(transition)
    }

    /// Record a transition and publish it
    async fn transition(
        &self,
        managed: &ManagedFn,
        run_name: &str,
        run_id: &RunId,
        state: RunState,
        metadata: TransitionMetadata,
    ) -> Result<StateTransition, CoreError> {
        let transition = self.recorder.transition(run_id, state, metadata).await?;
        self.emit(managed, run_name, transition.clone()).await;
        Ok(transition)
    }

    async fn emit(&self, managed: &ManagedFn, run_name: &str, transition: StateTransition) {
        let event = RunEvent {
            kind: managed.kind(),
            run_name: run_name.to_string(),
            callable_name: managed.name().to_string(),
            transition,
        };
        if let Err(e) = self.event_handler.handle_event(&event).await {
            warn!(
                run_id = %event.transition.run_id,
                error = %e,
                "Event handler failed for {}",
                event.event_type()
            );
        }
    }

    /// Append to the run log; a failing sink never fails the run
    async fn log(&self, run_id: &RunId, level: LogLevel, message: impl Into<String>) {
        if let Err(e) = self
            .log_sink
            .append(LogEntry::now(run_id.clone(), level, message))
            .await
        {
            warn!(run_id = %run_id, error = %e, "Could not append run log entry");
        }
    }
}

/// Aborts the attempt task when dropped
struct AttemptTask(JoinHandle<anyhow::Result<Value>>);

impl Drop for AttemptTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Records a `Cancelled` failure for a run whose driver is dropped before
/// the run reaches a terminal state
struct RunFinalizer {
    service: ExecutionService,
    managed: ManagedFn,
    run_id: RunId,
    name: String,
    attempt: u32,
    armed: bool,
}

impl RunFinalizer {
    fn new(service: ExecutionService, managed: ManagedFn, prepared: &PreparedRun) -> Self {
        Self {
            service,
            managed,
            run_id: prepared.run_id.clone(),
            name: prepared.name.clone(),
            attempt: 1,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunFinalizer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(run_id = %self.run_id, "Run dropped outside a runtime, state not finalized");
            return;
        };

        let service = self.service.clone();
        let managed = self.managed.clone();
        let run_id = self.run_id.clone();
        let name = self.name.clone();
        let attempt = self.attempt;
        runtime.spawn(async move {
            let failure = FailureRecord::new(
                FailureKind::Cancelled,
                "run was dropped before it finished",
            );
            if let Err(e) = service
                .abandon(&managed, &name, &run_id, attempt, Some(CANCELLED), failure)
                .await
            {
                debug!(run_id = %run_id, error = %e, "Could not record cancelled run");
            }
        });
    }
}

fn describe_delay(delay: Duration) -> String {
    if delay.is_zero() {
        "immediately".to_string()
    } else {
        format!("in {} seconds", delay.as_secs_f64())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

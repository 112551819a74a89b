//!
//! Flowrun Core - Run orchestration core
//!
//! This crate turns ordinary async functions into managed runs: parameters
//! are validated before a run starts, every state change is recorded in an
//! append-only history, and failed attempts are retried according to the
//! callable's policy. Storage backends implement the traits in
//! [`domain::repository`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - runs, parameters, retries and storage traits
pub mod domain;

/// Application services - registration and execution of managed callables
pub mod application;

/// Core types
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use error::{CoreError, RunError};
pub use types::{parameters, LogLevel, Parameters};

pub use domain::events::{
    BroadcastEventHandler, CompositeEventHandler, NoopEventHandler, RunEvent, RunEventHandler,
};
pub use domain::failure::{
    AttemptFailure, CallableFailure, FailureKind, FailureRecord, RunFailedError,
};
pub use domain::parameters::{
    ParamType, ParameterIssue, ParameterSpec, ParameterValidator, ValidationError,
};
pub use domain::repository::{
    LogEntry, LogSink, RetryTimer, RunFilter, RunRecorder, TokioRetryTimer,
};
pub use domain::retry::{RetryController, RetryDecision, RetryPolicy};
pub use domain::run::{
    generate_run_name, Run, RunId, RunKind, RunState, StateTransition, TransitionMetadata,
};

pub use application::context::RunContext;
pub use application::execution::{
    CompletedRun, ExecutionService, RunHandle, AWAITING_RETRY, CANCELLED, TIMED_OUT,
};
pub use application::managed::{
    flow, task, validate_callable_name, ManagedFn, ManagedFnBuilder, RunOptions,
};
pub use application::settings::EngineSettings;

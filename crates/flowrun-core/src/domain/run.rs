use crate::{domain::failure::FailureRecord, CoreError, Parameters};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Value object: Run ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a fresh run identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Kind of unit of work a run represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    /// A flow run
    Flow,
    /// A task run, usually started from inside a flow run
    Task,
}

impl RunKind {
    /// Lowercase name used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Flow => "flow",
            RunKind::Task => "task",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flow" => Ok(RunKind::Flow),
            "task" => Ok(RunKind::Task),
            other => Err(CoreError::SerializationError(format!(
                "unknown run kind: {}",
                other
            ))),
        }
    }
}

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    /// Created, not started yet
    Scheduled,
    /// An attempt is executing
    Running,
    /// The last attempt failed and another one is pending
    Retrying,
    /// Finished successfully
    Completed,
    /// Finished with a failure
    Failed,
}

impl RunState {
    /// Whether no further transition is allowed
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Scheduled -> Failed` is only issued for runs rejected before they
    /// start. `Retrying -> Failed` ends a run abandoned between attempts.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Scheduled, Running)
                | (Scheduled, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }

    /// Name used in storage and in transition records
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Scheduled => "Scheduled",
            RunState::Running => "Running",
            RunState::Retrying => "Retrying",
            RunState::Completed => "Completed",
            RunState::Failed => "Failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Scheduled" => Ok(RunState::Scheduled),
            "Running" => Ok(RunState::Running),
            "Retrying" => Ok(RunState::Retrying),
            "Completed" => Ok(RunState::Completed),
            "Failed" => Ok(RunState::Failed),
            other => Err(CoreError::SerializationError(format!(
                "unknown run state: {}",
                other
            ))),
        }
    }
}

/// Details attached to a state transition by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionMetadata {
    /// Attempt the transition belongs to
    pub attempt: u32,

    /// Display name overriding the state name (e.g. `TimedOut`)
    pub state_name: Option<String>,

    /// Human readable message
    pub message: Option<String>,

    /// Result value, for completions
    pub result: Option<serde_json::Value>,

    /// Failure details, for failed attempts
    pub failure: Option<FailureRecord>,

    /// Delay before the next attempt, for retries
    pub retry_delay_ms: Option<u64>,
}

impl TransitionMetadata {
    /// Metadata for the given attempt
    pub fn attempt(attempt: u32) -> Self {
        Self {
            attempt,
            ..Default::default()
        }
    }

    /// Set the display name
    pub fn with_state_name(mut self, name: impl Into<String>) -> Self {
        self.state_name = Some(name.into());
        self
    }

    /// Set the message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the result value
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Set the failure details
    pub fn with_failure(mut self, failure: FailureRecord) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Set the retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = Some(delay.as_millis() as u64);
        self
    }
}

/// An immutable record of a run moving from one state to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Run this transition belongs to
    pub run_id: RunId,

    /// Position in the run's history, dense and starting at 0
    pub sequence: u64,

    /// Previous state, `None` for the creation record
    pub from: Option<RunState>,

    /// New state
    pub to: RunState,

    /// Display name of the new state
    pub state_name: String,

    /// Attempt the transition belongs to
    pub attempt: u32,

    /// Human readable message
    pub message: Option<String>,

    /// Result value, for completions
    pub result: Option<serde_json::Value>,

    /// Failure details, for failed attempts
    pub failure: Option<FailureRecord>,

    /// Delay before the next attempt, for retries
    pub retry_delay_ms: Option<u64>,

    /// When the transition was recorded
    pub timestamp: DateTime<Utc>,
}

/// Aggregate: a run and its current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier
    pub id: RunId,

    /// Flow run or task run
    pub kind: RunKind,

    /// Human readable run name
    pub name: String,

    /// Name of the managed callable that produced the run
    pub callable_name: String,

    /// Run that started this one, if any
    pub parent_id: Option<RunId>,

    /// Validated parameters
    pub parameters: Parameters,

    /// Current state
    pub state: RunState,

    /// Display name of the current state
    pub state_name: String,

    /// Current attempt, starting at 1
    pub attempt: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// First time the run entered `Running`
    pub started_at: Option<DateTime<Utc>>,

    /// Time the run reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Result of a completed run
    pub result: Option<serde_json::Value>,

    /// Failure of a failed run
    pub failure: Option<FailureRecord>,
}

impl Run {
    /// Create a new run in `Scheduled` along with its creation record
    pub fn new(
        kind: RunKind,
        name: impl Into<String>,
        callable_name: impl Into<String>,
        parameters: Parameters,
        parent_id: Option<RunId>,
    ) -> (Self, StateTransition) {
        let now = Utc::now();
        let run = Self {
            id: RunId::generate(),
            kind,
            name: name.into(),
            callable_name: callable_name.into(),
            parent_id,
            parameters,
            state: RunState::Scheduled,
            state_name: RunState::Scheduled.as_str().to_string(),
            attempt: 1,
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
            result: None,
            failure: None,
        };

        let created = StateTransition {
            run_id: run.id.clone(),
            sequence: 0,
            from: None,
            to: RunState::Scheduled,
            state_name: run.state_name.clone(),
            attempt: 1,
            message: None,
            result: None,
            failure: None,
            retry_delay_ms: None,
            timestamp: now,
        };

        (run, created)
    }

    /// Move the run to `to`, returning the record to append at `sequence`.
    ///
    /// The run is left untouched when the state machine rejects the move.
    pub fn apply_transition(
        &mut self,
        to: RunState,
        metadata: TransitionMetadata,
        sequence: u64,
    ) -> Result<StateTransition, CoreError> {
        if !self.state.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                run_id: self.id.0.clone(),
                from: self.state,
                to,
            });
        }

        let now = Utc::now();
        let state_name = metadata
            .state_name
            .clone()
            .unwrap_or_else(|| to.as_str().to_string());
        let attempt = metadata.attempt.max(1);

        let transition = StateTransition {
            run_id: self.id.clone(),
            sequence,
            from: Some(self.state),
            to,
            state_name: state_name.clone(),
            attempt,
            message: metadata.message,
            result: metadata.result,
            failure: metadata.failure,
            retry_delay_ms: metadata.retry_delay_ms,
            timestamp: now,
        };

        self.state = to;
        self.state_name = state_name;
        self.attempt = attempt;
        self.updated_at = now;

        match to {
            RunState::Running => {
                self.started_at.get_or_insert(now);
            }
            RunState::Completed => {
                self.ended_at = Some(now);
                self.result = transition.result.clone();
                self.failure = None;
            }
            RunState::Failed => {
                self.ended_at = Some(now);
                self.failure = transition.failure.clone();
            }
            RunState::Retrying | RunState::Scheduled => {}
        }

        Ok(transition)
    }

    /// Whether the run reached a terminal state
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "daring", "eager", "fuzzy", "gentle", "hidden", "icy", "jolly",
    "keen", "lucky", "mellow", "nimble", "olive", "proud", "quiet", "rapid", "silver", "tidy",
];

const NOUNS: &[&str] = &[
    "badger", "condor", "dingo", "egret", "falcon", "gecko", "heron", "ibis", "jackal", "koala",
    "lemur", "marten", "newt", "otter", "puffin", "quail", "raven", "stoat", "tapir", "wombat",
];

/// Generate a readable `adjective-noun` run name
pub fn generate_run_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("calm");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{}-{}", adjective, noun)
}

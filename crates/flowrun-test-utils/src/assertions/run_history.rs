//! Assertion utilities for validating run histories.

use flowrun_core::{RunId, RunState, StateTransition};
use thiserror::Error;

/// Error type for run history validation failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunHistoryValidationError {
    #[error("Run history is empty")]
    EmptyHistory,

    #[error("State sequence mismatch: expected {expected:?}, got {actual:?}")]
    StateSequence {
        expected: Vec<RunState>,
        actual: Vec<RunState>,
    },

    #[error("History does not start with a creation record in Scheduled")]
    MissingCreation,

    #[error("Sequence gap at position {position}: found {sequence}")]
    SequenceGap { position: usize, sequence: u64 },

    #[error("History of run {expected} contains a transition of run {actual}")]
    ForeignTransition { expected: RunId, actual: RunId },

    #[error("Transition {sequence} starts from {from:?}, previous state was {previous}")]
    BrokenChain {
        sequence: u64,
        from: Option<RunState>,
        previous: RunState,
    },

    #[error("Illegal transition {from} -> {to} at sequence {sequence}")]
    IllegalTransition {
        sequence: u64,
        from: RunState,
        to: RunState,
    },

    #[error("Attempt went from {previous} to {attempt} at sequence {sequence}")]
    AttemptRegressed {
        sequence: u64,
        previous: u32,
        attempt: u32,
    },
}

/// States of `history`, in order
pub fn states(history: &[StateTransition]) -> Vec<RunState> {
    history.iter().map(|t| t.to).collect()
}

/// Display names of `history`, in order
pub fn state_names(history: &[StateTransition]) -> Vec<&str> {
    history.iter().map(|t| t.state_name.as_str()).collect()
}

/// Asserts that `history` visits exactly `expected`.
pub fn assert_state_sequence(
    history: &[StateTransition],
    expected: &[RunState],
) -> Result<(), RunHistoryValidationError> {
    let actual = states(history);
    if actual != expected {
        return Err(RunHistoryValidationError::StateSequence {
            expected: expected.to_vec(),
            actual,
        });
    }
    Ok(())
}

/// Asserts the structural guarantees every recorded history must keep.
///
/// * it opens with a creation record into Scheduled
/// * sequences are dense from 0 and all belong to one run
/// * each transition starts where the previous one ended and is a legal edge,
///   which also rules out anything after a terminal state
/// * attempt numbers never decrease
pub fn assert_monotonic_history(
    history: &[StateTransition],
) -> Result<(), RunHistoryValidationError> {
    let first = history
        .first()
        .ok_or(RunHistoryValidationError::EmptyHistory)?;
    if first.from.is_some() || first.to != RunState::Scheduled {
        return Err(RunHistoryValidationError::MissingCreation);
    }

    for (position, transition) in history.iter().enumerate() {
        if transition.sequence != position as u64 {
            return Err(RunHistoryValidationError::SequenceGap {
                position,
                sequence: transition.sequence,
            });
        }
        if transition.run_id != first.run_id {
            return Err(RunHistoryValidationError::ForeignTransition {
                expected: first.run_id.clone(),
                actual: transition.run_id.clone(),
            });
        }
    }

    for pair in history.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        if current.from != Some(previous.to) {
            return Err(RunHistoryValidationError::BrokenChain {
                sequence: current.sequence,
                from: current.from,
                previous: previous.to,
            });
        }
        if !previous.to.can_transition_to(current.to) {
            return Err(RunHistoryValidationError::IllegalTransition {
                sequence: current.sequence,
                from: previous.to,
                to: current.to,
            });
        }
        if current.attempt < previous.attempt {
            return Err(RunHistoryValidationError::AttemptRegressed {
                sequence: current.sequence,
                previous: previous.attempt,
                attempt: current.attempt,
            });
        }
    }

    Ok(())
}

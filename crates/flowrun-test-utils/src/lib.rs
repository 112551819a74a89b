//! Testing utilities for flowrun.
//!
//! Fakes for the collaborators of the execution service, callable bodies
//! with scripted failures, and assertions over recorded run histories.

pub mod assertions;
pub mod bodies;
pub mod fixtures;
pub mod implementations;

pub use assertions::*;
pub use bodies::{always_fail, fail_times, sleep_for, CallCounter};
pub use fixtures::TestEngine;
pub use implementations::RecordingRetryTimer;

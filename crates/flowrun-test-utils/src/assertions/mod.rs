//! Assertion utilities for validating recorded runs.

mod run_history;

pub use run_history::*;

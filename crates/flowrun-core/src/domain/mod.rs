/// Runs, run states and state transitions
pub mod run;

/// Callable failures and their recorded form
pub mod failure;

/// Declared parameters and their validation
pub mod parameters;

/// Retry policies and the retry controller
pub mod retry;

/// Storage collaborators: run recorder, log sink and retry timer
pub mod repository;

/// Run events published after each recorded transition
pub mod events;

//! Test implementations of core collaborators.

mod recording_retry_timer;

pub use recording_retry_timer::RecordingRetryTimer;

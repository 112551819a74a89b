/// Engine-wide settings
pub mod settings;

/// Managed callable registration
pub mod managed;

/// Context handed to callable bodies
pub mod context;

/// The execution wrapper
pub mod execution;

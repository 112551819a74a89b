//! Observability for flowrun.
//!
//! Process-wide structured logging, a log sink decorator that mirrors run
//! logs into `tracing`, and an event handler that counts transitions through
//! the `metrics` facade.

use serde::{Deserialize, Serialize};

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogExt, TracingLogSink};
pub use metrics::{RunMetricsHandler, RunMetricsSnapshot};

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log level filter (e.g., "info,flowrun_core=debug"), overridden by `RUST_LOG`
    pub log_filter: String,
    /// Emit JSON lines instead of human readable output
    pub enable_json_logging: bool,
    /// Record run counters through the `metrics` facade
    pub enable_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "flowrun".to_string(),
            log_filter: "info".to_string(),
            enable_json_logging: false,
            enable_metrics: true,
        }
    }
}

//! Structured logging using tracing.
//!
//! `init_logging` installs the process-wide subscriber. `TracingLogSink`
//! mirrors every run log entry into that subscriber while still storing it in
//! the wrapped sink.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

use flowrun_core::{CoreError, LogEntry, LogLevel, LogSink, RunId};

use crate::MonitoringConfig;

/// Initialize structured logging
pub fn init_logging(config: &MonitoringConfig) -> anyhow::Result<()> {
    let env_filter = log_filter(config)?;

    // JSON logs for production
    let json_layer = config.enable_json_logging.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    // Pretty logs for development
    let pretty_layer = (!config.enable_json_logging).then(|| {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    info!(
        service_name = %config.service_name,
        log_format = if config.enable_json_logging { "json" } else { "pretty" },
        "Logging initialized"
    );

    Ok(())
}

/// The configured filter, overridden by `RUST_LOG` when that is set.
///
/// The configured filter is checked even when `RUST_LOG` wins.
fn log_filter(config: &MonitoringConfig) -> anyhow::Result<EnvFilter> {
    let configured = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("Invalid log filter '{}'", config.log_filter))?;
    Ok(EnvFilter::try_from_default_env().unwrap_or(configured))
}

/// Log sink that also emits each entry as a tracing event
#[derive(Clone)]
pub struct TracingLogSink {
    inner: Arc<dyn LogSink>,
}

impl TracingLogSink {
    /// Wrap `inner`, which keeps storing the entries
    pub fn new(inner: Arc<dyn LogSink>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl LogSink for TracingLogSink {
    async fn append(&self, entry: LogEntry) -> Result<(), CoreError> {
        let run_id = &entry.run_id;
        let message = &entry.message;
        match entry.level {
            LogLevel::Trace => tracing::trace!(target: "flowrun::run", %run_id, "{}", message),
            LogLevel::Debug => tracing::debug!(target: "flowrun::run", %run_id, "{}", message),
            LogLevel::Info => tracing::info!(target: "flowrun::run", %run_id, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "flowrun::run", %run_id, "{}", message),
            LogLevel::Error => tracing::error!(target: "flowrun::run", %run_id, "{}", message),
        }
        self.inner.append(entry).await
    }

    async fn read_logs(&self, run_id: &RunId) -> Result<Vec<LogEntry>, CoreError> {
        self.inner.read_logs(run_id).await
    }
}

/// Trait to add log context to results
pub trait LogExt<T, E> {
    /// Log error with additional context before returning
    fn log_err(self, message: &str) -> Result<T, E>;

    /// Log success with additional context before returning
    fn log_ok(self, message: &str) -> Result<T, E>;
}

impl<T, E: std::fmt::Display> LogExt<T, E> for Result<T, E> {
    fn log_err(self, message: &str) -> Result<T, E> {
        if let Err(ref e) = self {
            tracing::error!("{}: {}", message, e);
        }
        self
    }

    fn log_ok(self, message: &str) -> Result<T, E> {
        if self.is_ok() {
            tracing::info!("{}", message);
        }
        self
    }
}

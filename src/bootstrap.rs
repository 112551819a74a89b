//! Wiring of an execution engine from [`Settings`].

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use flowrun_core::{
    BroadcastEventHandler, CompositeEventHandler, ExecutionService, LogSink, RunEvent,
    RunRecorder,
};
use flowrun_monitoring::{LogExt, RunMetricsHandler, RunMetricsSnapshot, TracingLogSink};
use flowrun_state_inmemory::InMemoryStateStoreProvider;
use flowrun_state_sqlite::{SqliteConfig, SqliteStateStoreProvider};
use tokio::sync::broadcast;

use crate::settings::Settings;

const EVENT_BUFFER: usize = 1024;

/// A configured execution service with its observers
#[derive(Clone)]
pub struct Engine {
    service: ExecutionService,
    metrics: Option<RunMetricsHandler>,
    events: BroadcastEventHandler,
}

impl Engine {
    /// The execution service
    pub fn service(&self) -> &ExecutionService {
        &self.service
    }

    /// Run totals, when metrics are enabled
    pub fn metrics(&self) -> Option<RunMetricsSnapshot> {
        self.metrics.as_ref().map(RunMetricsHandler::snapshot)
    }

    /// Watch run events recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }
}

/// Build an engine on the store selected by `settings.storage`
pub async fn bootstrap(settings: &Settings) -> anyhow::Result<Engine> {
    settings.engine.validate()?;

    let (recorder, logs): (Arc<dyn RunRecorder>, Arc<dyn LogSink>) =
        match &settings.storage.database_url {
            Some(url) => {
                let provider = SqliteStateStoreProvider::with_config(SqliteConfig {
                    database_url: url.clone(),
                    max_connections: settings.storage.max_connections,
                    ..Default::default()
                })
                .await
                .with_context(|| format!("Failed to open run store at {}", url))
                .log_err("Run store unavailable")?;
                info!(url = %url, "Using SQLite run store");
                provider.create_repositories()
            }
            None => {
                info!("Using in-memory run store");
                InMemoryStateStoreProvider::new().create_repositories()
            }
        };

    let events = BroadcastEventHandler::new(EVENT_BUFFER);
    let mut handler = CompositeEventHandler::new().with(Arc::new(events.clone()));
    let metrics = settings
        .monitoring
        .enable_metrics
        .then(RunMetricsHandler::new);
    if let Some(metrics) = &metrics {
        handler = handler.with(Arc::new(metrics.clone()));
    }

    let service = ExecutionService::new(recorder, Arc::new(TracingLogSink::new(logs)))
        .with_event_handler(Arc::new(handler))
        .with_settings(settings.engine.clone())
        .context("Invalid engine settings")?;

    info!(
        service_name = %settings.monitoring.service_name,
        default_retries = settings.engine.default_retries,
        "Execution engine ready"
    );

    Ok(Engine {
        service,
        metrics,
        events,
    })
}

//! Layered configuration for the engine.
//!
//! Values come from an optional file and then from `FLOWRUN__*` environment
//! variables, e.g. `FLOWRUN__ENGINE__DEFAULT_RETRIES=3` or
//! `FLOWRUN__STORAGE__DATABASE_URL=sqlite://runs.db`.

use anyhow::Context;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use flowrun_core::EngineSettings;
use flowrun_monitoring::MonitoringConfig;

/// Where runs and logs are stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite URL; runs are kept in memory when unset
    pub database_url: Option<String>,

    /// Maximum number of pooled SQLite connections
    pub max_connections: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
        }
    }
}

/// Top level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Engine defaults for retries, delays and timeouts
    pub engine: EngineSettings,

    /// Logging and metrics
    pub monitoring: MonitoringConfig,

    /// Run storage
    pub storage: StorageSettings,
}

impl Settings {
    /// Load settings from `path` (if given) overlaid with `FLOWRUN__*` variables
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("FLOWRUN")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        settings.engine.validate()?;
        Ok(settings)
    }
}

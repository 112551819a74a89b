//! Managed, observable and retryable runs for ordinary async functions.
//!
//! This crate ties the workspace together: it re-exports the core API, loads
//! [`Settings`] from files and the environment, and [`bootstrap`]s an
//! execution engine on the configured store.
//!
//! ```no_run
//! use flowrun::{bootstrap, flow, Parameters, Settings};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let settings = Settings::load(None)?;
//! let engine = bootstrap(&settings).await?;
//!
//! let hello = flow("hello").build(|_ctx| async move { Ok::<_, anyhow::Error>("hi") })?;
//! let completed = engine.service().run(&hello, Parameters::new()).await?;
//! assert_eq!(completed.value_as::<String>()?, "hi");
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod settings;

pub use bootstrap::{bootstrap, Engine};
pub use settings::{Settings, StorageSettings};

pub use flowrun_core::*;
pub use flowrun_monitoring::{init_logging, MonitoringConfig, RunMetricsSnapshot};

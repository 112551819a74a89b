//! SQLite state store implementation for flowrun
//!
//! This crate provides durable implementations of the recorder and log sink
//! interfaces defined in the flowrun-core crate. Run histories written here
//! survive process restarts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub mod migrations;
pub mod repositories;

pub use repositories::{SqliteLogSink, SqliteRunRecorder};

use flowrun_core::{CoreError, LogSink, RunRecorder};

/// Configuration for the SQLite database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Database URL, e.g. `sqlite://flowrun.db` or `sqlite::memory:`
    pub database_url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Timeout for acquiring a connection or a write lock (in seconds)
    pub acquire_timeout_secs: u64,

    /// Whether to run migrations on startup
    pub run_migrations: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://flowrun.db".to_string(),
            max_connections: 5,
            acquire_timeout_secs: 30,
            run_migrations: true,
        }
    }
}

impl SqliteConfig {
    /// Whether the URL points at a private in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

pub(crate) fn store_error(err: sqlx::Error) -> CoreError {
    CoreError::StateStoreError(err.to_string())
}

/// SQLite connection pool wrapper
#[derive(Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Open (creating if needed) the database described by `config`
    pub async fn new(config: &SqliteConfig) -> Result<Self, CoreError> {
        let acquire_timeout = Duration::from_secs(config.acquire_timeout_secs);
        let mut options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| {
                CoreError::ConfigurationError(format!(
                    "Invalid SQLite URL '{}': {}",
                    config.database_url, e
                ))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(acquire_timeout);

        // Every connection to `:memory:` is a separate database, so keep a
        // single connection alive for the pool's lifetime
        let pool_options = if config.is_in_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::StateStoreError(format!("Failed to open SQLite database: {}", e)))?;
        debug!(url = %config.database_url, "Connected to SQLite database");

        let db = Self { pool };
        if config.run_migrations {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    /// Apply pending migrations, recording each one in `schema_migrations`
    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (name TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        for (name, sql) in migrations::generate_migrations() {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM schema_migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(store_error)?;
            if applied.is_some() {
                continue;
            }

            let mut tx = self.pool.begin().await.map_err(store_error)?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| CoreError::StateStoreError(format!("Migration {} failed: {}", name, e)))?;
            sqlx::query("INSERT INTO schema_migrations (name, applied_at) VALUES (?, ?)")
                .bind(name)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
            tx.commit().await.map_err(store_error)?;
            info!(migration = name, "Applied migration");
        }
        Ok(())
    }

    /// Names of the applied migrations, oldest first
    pub async fn applied_migrations(&self) -> Result<Vec<String>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM schema_migrations ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// Get the database connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Provider for SQLite state store repositories
pub struct SqliteStateStoreProvider {
    database: SqliteDatabase,
}

impl SqliteStateStoreProvider {
    /// Create a provider for `database_url` with default configuration
    pub async fn new(database_url: &str) -> Result<Self, CoreError> {
        let config = SqliteConfig {
            database_url: database_url.to_string(),
            ..Default::default()
        };

        Self::with_config(config).await
    }

    /// Create a provider with custom configuration
    pub async fn with_config(config: SqliteConfig) -> Result<Self, CoreError> {
        let database = SqliteDatabase::new(&config).await?;
        Ok(Self { database })
    }

    /// The underlying database
    pub fn database(&self) -> &SqliteDatabase {
        &self.database
    }

    /// Create the recorder and log sink used by the execution service
    pub fn create_repositories(&self) -> (Arc<dyn RunRecorder>, Arc<dyn LogSink>) {
        let recorder = Arc::new(SqliteRunRecorder::new(self.database.clone()));
        let logs = Arc::new(SqliteLogSink::new(self.database.clone()));
        (recorder, logs)
    }
}

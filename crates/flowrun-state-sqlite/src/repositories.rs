use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use flowrun_core::{
    CoreError, LogEntry, LogLevel, LogSink, Parameters, Run, RunFilter, RunId, RunKind,
    RunRecorder, RunState, StateTransition, TransitionMetadata,
};

use crate::{store_error, SqliteDatabase};

async fn insert_transition(
    conn: &mut sqlx::SqliteConnection,
    transition: &StateTransition,
) -> Result<(), CoreError> {
    let data = serde_json::to_string(transition)?;
    sqlx::query(
        "INSERT INTO run_transitions (run_id, sequence, to_state, data, recorded_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&transition.run_id.0)
    .bind(transition.sequence as i64)
    .bind(transition.to.as_str())
    .bind(data)
    .bind(transition.timestamp)
    .execute(conn)
    .await
    .map_err(store_error)?;
    Ok(())
}

fn decode_run(row: &sqlx::sqlite::SqliteRow) -> Result<Run, CoreError> {
    let data: String = row
        .try_get("data")
        .map_err(|e| CoreError::SerializationError(format!("Error getting run data: {}", e)))?;
    serde_json::from_str(&data)
        .map_err(|e| CoreError::SerializationError(format!("Error deserializing run: {}", e)))
}

/// SQLite implementation of the RunRecorder
#[derive(Clone)]
pub struct SqliteRunRecorder {
    db: SqliteDatabase,
}

impl SqliteRunRecorder {
    /// Create a new SQLite run recorder
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RunRecorder for SqliteRunRecorder {
    async fn create_run(
        &self,
        kind: RunKind,
        name: &str,
        callable_name: &str,
        parameters: &Parameters,
        parent_id: Option<&RunId>,
    ) -> Result<RunId, CoreError> {
        let (run, created) = Run::new(
            kind,
            name,
            callable_name,
            parameters.clone(),
            parent_id.cloned(),
        );
        let data = serde_json::to_string(&run)?;

        let mut tx = self.db.pool().begin().await.map_err(store_error)?;
        sqlx::query(
            "INSERT INTO runs (id, kind, name, callable_name, parent_id, state, data, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id.0)
        .bind(run.kind.as_str())
        .bind(&run.name)
        .bind(&run.callable_name)
        .bind(run.parent_id.as_ref().map(|p| p.0.clone()))
        .bind(run.state.as_str())
        .bind(data)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;
        insert_transition(&mut tx, &created).await?;
        tx.commit().await.map_err(store_error)?;

        debug!(run_id = %run.id, kind = %kind, "Created run");
        Ok(run.id)
    }

    async fn transition(
        &self,
        run_id: &RunId,
        new_state: RunState,
        metadata: TransitionMetadata,
    ) -> Result<StateTransition, CoreError> {
        let mut tx = self.db.pool().begin().await.map_err(store_error)?;

        // Write first so the transaction holds the write lock before it reads;
        // concurrent writers then wait on the busy timeout instead of failing
        let touched = sqlx::query("UPDATE runs SET updated_at = updated_at WHERE id = ?")
            .bind(&run_id.0)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        if touched.rows_affected() == 0 {
            return Err(CoreError::RunNotFound(run_id.0.clone()));
        }

        let row = sqlx::query(
            "SELECT data, (SELECT COUNT(*) FROM run_transitions WHERE run_id = ?) AS next_sequence \
             FROM runs WHERE id = ?",
        )
        .bind(&run_id.0)
        .bind(&run_id.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_error)?;

        let mut run = decode_run(&row)?;
        let next_sequence: i64 = row.try_get("next_sequence").map_err(store_error)?;

        // A rejected transition drops `tx`, rolling back the lock-taking update
        let transition = run.apply_transition(new_state, metadata, next_sequence as u64)?;

        sqlx::query("UPDATE runs SET state = ?, data = ?, updated_at = ? WHERE id = ?")
            .bind(run.state.as_str())
            .bind(serde_json::to_string(&run)?)
            .bind(run.updated_at)
            .bind(&run_id.0)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        insert_transition(&mut tx, &transition).await?;
        tx.commit().await.map_err(store_error)?;

        debug!(
            run_id = %run_id,
            sequence = transition.sequence,
            state = %transition.state_name,
            attempt = transition.attempt,
            "Recorded transition"
        );
        Ok(transition)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Run, CoreError> {
        let row = sqlx::query("SELECT data FROM runs WHERE id = ?")
            .bind(&run_id.0)
            .fetch_optional(self.db.pool())
            .await
            .map_err(store_error)?
            .ok_or_else(|| CoreError::RunNotFound(run_id.0.clone()))?;
        decode_run(&row)
    }

    async fn history(&self, run_id: &RunId) -> Result<Vec<StateTransition>, CoreError> {
        let rows = sqlx::query("SELECT data FROM run_transitions WHERE run_id = ? ORDER BY sequence")
            .bind(&run_id.0)
            .fetch_all(self.db.pool())
            .await
            .map_err(store_error)?;

        // Every run has at least its creation record
        if rows.is_empty() {
            return Err(CoreError::RunNotFound(run_id.0.clone()));
        }

        rows.iter()
            .map(|row| -> Result<StateTransition, CoreError> {
                let data: String = row.try_get("data").map_err(store_error)?;
                Ok(serde_json::from_str(&data)?)
            })
            .collect()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, CoreError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT data FROM runs WHERE 1 = 1");
        if let Some(kind) = filter.kind {
            query.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(parent) = &filter.parent_id {
            query.push(" AND parent_id = ").push_bind(parent.0.clone());
        }
        if let Some(callable_name) = &filter.callable_name {
            query
                .push(" AND callable_name = ")
                .push_bind(callable_name.clone());
        }
        query.push(" ORDER BY rowid");

        let rows = query
            .build()
            .fetch_all(self.db.pool())
            .await
            .map_err(store_error)?;
        rows.iter().map(decode_run).collect()
    }
}

/// SQLite implementation of the LogSink
#[derive(Clone)]
pub struct SqliteLogSink {
    db: SqliteDatabase,
}

impl SqliteLogSink {
    /// Create a new SQLite log sink
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LogSink for SqliteLogSink {
    async fn append(&self, entry: LogEntry) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO run_logs (run_id, level, message, timestamp) VALUES (?, ?, ?, ?)")
            .bind(&entry.run_id.0)
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .bind(entry.timestamp)
            .execute(self.db.pool())
            .await
            .map_err(|e| CoreError::LogSinkError(e.to_string()))?;
        Ok(())
    }

    async fn read_logs(&self, run_id: &RunId) -> Result<Vec<LogEntry>, CoreError> {
        let rows = sqlx::query(
            "SELECT level, message, timestamp FROM run_logs WHERE run_id = ? ORDER BY id",
        )
        .bind(&run_id.0)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| CoreError::LogSinkError(e.to_string()))?;

        rows.iter()
            .map(|row| -> Result<LogEntry, CoreError> {
                let level: String = row.try_get("level").map_err(store_error)?;
                let message: String = row.try_get("message").map_err(store_error)?;
                let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(store_error)?;
                Ok(LogEntry {
                    run_id: run_id.clone(),
                    level: level.parse::<LogLevel>().map_err(CoreError::SerializationError)?,
                    message,
                    timestamp,
                })
            })
            .collect()
    }
}

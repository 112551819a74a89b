use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use flowrun_core::{
    CoreError, LogEntry, LogSink, Parameters, Run, RunFilter, RunId, RunKind, RunRecorder,
    RunState, StateTransition, TransitionMetadata,
};

/// A run and its history, guarded by a per-run lock
#[derive(Debug)]
pub(crate) struct RunEntry {
    order: u64,
    run: Run,
    history: Vec<StateTransition>,
}

/// Runs shared by every recorder of a provider
#[derive(Debug, Default)]
pub(crate) struct RunStore {
    runs: DashMap<String, Arc<Mutex<RunEntry>>>,
    next_order: AtomicU64,
}

/// In-memory implementation of the RunRecorder.
///
/// Transitions of one run are serialized by that run's mutex; different runs
/// never contend on the same lock.
pub struct InMemoryRunRecorder {
    store: Arc<RunStore>,
}

impl InMemoryRunRecorder {
    /// Create a recorder with its own empty storage
    pub fn new() -> Self {
        Self::with_store(Arc::new(RunStore::default()))
    }

    pub(crate) fn with_store(store: Arc<RunStore>) -> Self {
        Self { store }
    }

    fn entry(&self, run_id: &RunId) -> Result<Arc<Mutex<RunEntry>>, CoreError> {
        // Clone the Arc so the shard lock is released before awaiting
        self.store
            .runs
            .get(run_id.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::RunNotFound(run_id.0.clone()))
    }
}

impl Default for InMemoryRunRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunRecorder for InMemoryRunRecorder {
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
        let run_id = run.id.clone();
        let order = self.store.next_order.fetch_add(1, Ordering::SeqCst);

        self.store.runs.insert(
            run_id.0.clone(),
            Arc::new(Mutex::new(RunEntry {
                order,
                run,
                history: vec![created],
            })),
        );
        debug!(run_id = %run_id, kind = %kind, "Created run");
        Ok(run_id)
    }

    async fn transition(
        &self,
        run_id: &RunId,
        new_state: RunState,
        metadata: TransitionMetadata,
    ) -> Result<StateTransition, CoreError> {
        let entry = self.entry(run_id)?;
        let mut entry = entry.lock().await;

        let sequence = entry.history.len() as u64;
        let transition = entry.run.apply_transition(new_state, metadata, sequence)?;
        entry.history.push(transition.clone());

        debug!(
            run_id = %run_id,
            sequence,
            state = %transition.state_name,
            attempt = transition.attempt,
            "Recorded transition"
        );
        Ok(transition)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Run, CoreError> {
        let entry = self.entry(run_id)?;
        let entry = entry.lock().await;
        Ok(entry.run.clone())
    }

    async fn history(&self, run_id: &RunId) -> Result<Vec<StateTransition>, CoreError> {
        let entry = self.entry(run_id)?;
        let entry = entry.lock().await;
        Ok(entry.history.clone())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, CoreError> {
        let entries: Vec<Arc<Mutex<RunEntry>>> =
            self.store.runs.iter().map(|entry| entry.value().clone()).collect();

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.lock().await;
            if filter.matches(&entry.run) {
                runs.push((entry.order, entry.run.clone()));
            }
        }
        runs.sort_by_key(|(order, _)| *order);
        Ok(runs.into_iter().map(|(_, run)| run).collect())
    }
}

/// In-memory implementation of the LogSink
#[derive(Default)]
pub struct InMemoryLogSink {
    entries: DashMap<String, Vec<LogEntry>>,
}

impl InMemoryLogSink {
    /// Create an empty log sink
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogSink for InMemoryLogSink {
    async fn append(&self, entry: LogEntry) -> Result<(), CoreError> {
        self.entries
            .entry(entry.run_id.0.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn read_logs(&self, run_id: &RunId) -> Result<Vec<LogEntry>, CoreError> {
        Ok(self
            .entries
            .get(run_id.as_str())
            .map(|entries| entries.value().clone())
            .unwrap_or_default())
    }
}

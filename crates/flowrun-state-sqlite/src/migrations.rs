/// Generate SQL migrations for the SQLite state store
///
/// Each entry is applied once, in order, and recorded by name in the
/// `schema_migrations` table.
pub fn generate_migrations() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "20240601000000_initial_schema",
            r#"
            -- Runs, with the full run snapshot as JSON
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                callable_name TEXT NOT NULL,
                parent_id TEXT,
                state TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_parent_id ON runs(parent_id);
            CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);
            CREATE INDEX IF NOT EXISTS idx_runs_callable_name ON runs(callable_name);

            -- Append-only state history
            CREATE TABLE IF NOT EXISTS run_transitions (
                run_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                to_state TEXT NOT NULL,
                data TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (run_id, sequence),
                CONSTRAINT fk_run_transitions_run_id FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            );
            "#,
        ),
        (
            "20240602000000_run_logs",
            r#"
            CREATE TABLE IF NOT EXISTS run_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_run_logs_run_id ON run_logs(run_id, id);
            "#,
        ),
    ]
}

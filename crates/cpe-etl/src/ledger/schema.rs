//! SQLite schema for the execution ledger

use rusqlite::Connection;

/// Create ledger tables if they do not exist
///
/// Both tables are append-only; triggers reject updates and deletes.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS etl_runs (
            batch_id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            ended_at TEXT NOT NULL,
            status TEXT NOT NULL,

            -- Aggregates over etl_job_results
            rows_queried_total INTEGER NOT NULL,
            rows_inserted_total INTEGER NOT NULL,
            job_count INTEGER NOT NULL,
            failed_job_count INTEGER NOT NULL,

            error_summary TEXT,
            recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS etl_job_results (
            batch_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            job_name TEXT NOT NULL,
            source_kind TEXT NOT NULL,
            target TEXT NOT NULL,
            rows_queried INTEGER NOT NULL,
            rows_inserted INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            error_kind TEXT,
            error_detail TEXT,
            started_at TEXT NOT NULL,
            ended_at TEXT NOT NULL,

            PRIMARY KEY (batch_id, ordinal),
            UNIQUE (batch_id, job_name),
            FOREIGN KEY (batch_id) REFERENCES etl_runs(batch_id)
        );

        CREATE INDEX IF NOT EXISTS idx_etl_runs_started_at ON etl_runs(started_at);

        CREATE TRIGGER IF NOT EXISTS etl_runs_no_update
        BEFORE UPDATE ON etl_runs
        BEGIN
            SELECT RAISE(ABORT, 'etl_runs is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS etl_runs_no_delete
        BEFORE DELETE ON etl_runs
        BEGIN
            SELECT RAISE(ABORT, 'etl_runs is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS etl_job_results_no_update
        BEFORE UPDATE ON etl_job_results
        BEGIN
            SELECT RAISE(ABORT, 'etl_job_results is append-only');
        END;
        "#,
    )
}

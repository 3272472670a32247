//! SQLite-backed execution ledger

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use super::{ensure_closed, schema, ExecutionLedger};
use crate::error::{EtlError, Result};
use crate::model::{BatchId, JobResult, Run, RunSummary};

/// Ledger stored in a local SQLite database
#[derive(Clone)]
pub struct SqliteLedger {
    db: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open (or create) the ledger database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EtlError::ledger_write(format!(
                    "Failed to create ledger directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| EtlError::ledger_write(format!("Failed to open ledger database: {e}")))?;
        Self::from_connection(conn)
    }

    /// Ledger that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            EtlError::ledger_write(format!("Failed to create in-memory ledger: {e}"))
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| EtlError::ledger_write(format!("Failed to enable foreign keys: {e}")))?;
        schema::init_schema(&conn)
            .map_err(|e| EtlError::ledger_write(format!("Failed to initialize schema: {e}")))?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&db)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| EtlError::ledger_write(format!("Ledger task failed: {e}")))?
    }

    fn load_summary(conn: &Connection, batch_id: &str) -> Result<Option<RunSummary>> {
        let run = conn
            .query_row(
                r#"
                SELECT batch_id, started_at, ended_at, status, error_summary
                FROM etl_runs
                WHERE batch_id = ?1
                "#,
                params![batch_id],
                read_run,
            )
            .optional()
            .map_err(|e| EtlError::ledger_write(format!("Failed to read run: {e}")))?;

        let Some(run) = run else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                r#"
                SELECT job_name, batch_id, source_kind, target, rows_queried, rows_inserted,
                       outcome, error_kind, error_detail, started_at, ended_at
                FROM etl_job_results
                WHERE batch_id = ?1
                ORDER BY ordinal ASC
                "#,
            )
            .map_err(|e| EtlError::ledger_write(format!("Failed to prepare query: {e}")))?;

        let results = stmt
            .query_map(params![batch_id], read_job_result)
            .map_err(|e| EtlError::ledger_write(format!("Failed to query job results: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EtlError::ledger_write(format!("Failed to collect job results: {e}")))?;

        Ok(Some(RunSummary::new(run, results)))
    }
}

#[async_trait]
impl ExecutionLedger for SqliteLedger {
    async fn record(&self, run: &Run, results: &[JobResult]) -> Result<()> {
        ensure_closed(run)?;
        let summary = RunSummary::new(run.clone(), results.to_vec());
        self.with_conn(move |conn| insert_run(conn, &summary)).await
    }

    async fn latest_summary(&self) -> Result<Option<RunSummary>> {
        self.with_conn(|conn| {
            let latest: Option<String> = conn
                .query_row(
                    "SELECT batch_id FROM etl_runs ORDER BY started_at DESC, batch_id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| EtlError::ledger_write(format!("Failed to query latest run: {e}")))?;

            match latest {
                Some(batch_id) => Self::load_summary(conn, &batch_id),
                None => Ok(None),
            }
        })
        .await
    }

    async fn summary(&self, batch_id: &BatchId) -> Result<Option<RunSummary>> {
        let batch_id = batch_id.as_str().to_string();
        self.with_conn(move |conn| Self::load_summary(conn, &batch_id))
            .await
    }
}

fn lock(db: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| EtlError::ledger_write(format!("Failed to acquire database lock: {e}")))
}

fn insert_run(conn: &mut Connection, summary: &RunSummary) -> Result<()> {
    let run = &summary.run;
    let results = &summary.results;

    let tx = conn
        .transaction()
        .map_err(|e| EtlError::ledger_write(format!("Failed to begin transaction: {e}")))?;

    tx.execute(
        r#"
        INSERT INTO etl_runs (
            batch_id, started_at, ended_at, status,
            rows_queried_total, rows_inserted_total, job_count, failed_job_count,
            error_summary
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            run.batch_id.as_str(),
            run.started_at.to_rfc3339(),
            run.ended_at.map(|t| t.to_rfc3339()),
            run.status.as_str(),
            to_sql_count(summary.rows_queried_total())?,
            to_sql_count(summary.rows_inserted_total())?,
            to_sql_count(results.len() as u64)?,
            to_sql_count(summary.failed_jobs().count() as u64)?,
            run.error_summary,
        ],
    )
    .map_err(|e| {
        EtlError::ledger_write(format!("Failed to insert run {}: {e}", run.batch_id))
    })?;

    for (ordinal, result) in results.iter().enumerate() {
        tx.execute(
            r#"
            INSERT INTO etl_job_results (
                batch_id, ordinal, job_name, source_kind, target,
                rows_queried, rows_inserted, outcome, error_kind, error_detail,
                started_at, ended_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                run.batch_id.as_str(),
                to_sql_count(ordinal as u64)?,
                result.job_name,
                result.source_kind.as_str(),
                result.target,
                to_sql_count(result.rows_queried)?,
                to_sql_count(result.rows_inserted)?,
                result.outcome.as_str(),
                result.error_kind.map(|k| k.as_str()),
                result.error_detail,
                result.started_at.to_rfc3339(),
                result.ended_at.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            EtlError::ledger_write(format!(
                "Failed to insert result for job {}: {e}",
                result.job_name
            ))
        })?;
    }

    tx.commit()
        .map_err(|e| EtlError::ledger_write(format!("Failed to commit ledger entry: {e}")))?;

    info!(
        "Recorded run {} ({}, {} jobs) in ledger",
        run.batch_id,
        run.status,
        results.len()
    );
    Ok(())
}

fn to_sql_count(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| EtlError::ledger_write(format!("count {value} does not fit in the ledger")))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_count(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|e| conversion_error(idx, e))
}

fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = EtlError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn read_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        batch_id: BatchId::new(row.get::<_, String>(0)?),
        started_at: parse_time(row, 1)?,
        ended_at: Some(parse_time(row, 2)?),
        status: parse_text(row, 3)?,
        error_summary: row.get(4)?,
    })
}

fn read_job_result(row: &Row<'_>) -> rusqlite::Result<JobResult> {
    let error_kind = match row.get::<_, Option<String>>(7)? {
        Some(raw) => Some(raw.parse().map_err(|e| conversion_error(7, e))?),
        None => None,
    };

    Ok(JobResult {
        job_name: row.get(0)?,
        batch_id: BatchId::new(row.get::<_, String>(1)?),
        source_kind: parse_text(row, 2)?,
        target: row.get(3)?,
        rows_queried: parse_count(row, 4)?,
        rows_inserted: parse_count(row, 5)?,
        outcome: parse_text(row, 6)?,
        error_kind,
        error_detail: row.get(8)?,
        started_at: parse_time(row, 9)?,
        ended_at: parse_time(row, 10)?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{Job, QueryRef, RunStatus, SourceKind};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn partial_run(start: i64) -> (Run, Vec<JobResult>) {
        let mut run = Run::start(at(start));
        let ok = Job::new("commission_items", SourceKind::Warehouse, QueryRef::new("a.sql"), "stg_a");
        let bad = Job::new("opportunities", SourceKind::Crm, QueryRef::new("b.soql"), "stg_b");
        let results = vec![
            JobResult::succeeded(&ok, &run.batch_id, 1000, 1000, at(start), at(start + 1)),
            JobResult::failed(
                &bad,
                &run.batch_id,
                200,
                &EtlError::load("stg_b", Some(50), "constraint"),
                at(start + 1),
                at(start + 2),
            ),
        ];
        run.close(at(start + 3), &results, None);
        (run, results)
    }

    #[tokio::test]
    async fn test_record_and_read_back() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let (run, results) = partial_run(0);

        ledger.record(&run, &results).await.unwrap();
        let summary = ledger.summary(&run.batch_id).await.unwrap().unwrap();

        assert_eq!(summary.run, run);
        assert_eq!(summary.results, results);
        assert_eq!(summary.run.status, RunStatus::Partial);
        assert_eq!(summary.rows_queried_total(), 1200);
        assert_eq!(summary.rows_inserted_total(), 1050);
        assert_eq!(summary.results[1].error_kind, Some(ErrorKind::Load));
    }

    #[tokio::test]
    async fn test_duplicate_batch_is_rejected() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let (run, results) = partial_run(0);

        ledger.record(&run, &results).await.unwrap();
        let err = ledger.record(&run, &results).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LedgerWrite);

        // The first record is untouched
        let summary = ledger.summary(&run.batch_id).await.unwrap().unwrap();
        assert_eq!(summary.results.len(), 2);
    }

    #[tokio::test]
    async fn test_latest_summary_picks_newest_run() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteLedger::open(dir.path().join("metrics/etl_ledger.db")).unwrap();
        assert!(ledger.latest_summary().await.unwrap().is_none());

        let (older, older_results) = partial_run(0);
        let (newer, newer_results) = partial_run(60);
        ledger.record(&newer, &newer_results).await.unwrap();
        ledger.record(&older, &older_results).await.unwrap();

        let latest = ledger.latest_summary().await.unwrap().unwrap();
        assert_eq!(latest.run.batch_id, newer.batch_id);
    }

    #[tokio::test]
    async fn test_open_run_is_not_recorded() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let run = Run::start(at(0));
        assert!(ledger.record(&run, &[]).await.is_err());
        assert!(ledger.latest_summary().await.unwrap().is_none());
    }
}

//! Core types for an ETL run
//!
//! A [`Run`] owns its [`JobResult`]s; both are plain data so they can be
//! handed to the ledger and the notification gateway without borrowing the
//! orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, EtlError, Result};

/// Column stamped with the run's batch identifier on every staged row
pub const BATCH_ID_COLUMN: &str = "etl_batch_id";

/// Column stamped with the extraction timestamp on every staged row
pub const EXTRACTED_AT_COLUMN: &str = "extracted_at";

/// Per-run identifier, derived from the wall clock at run start
///
/// Format is `YYYYMMDDHHMMSSmmm` (UTC), so lexical order equals creation
/// order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.format("%Y%m%d%H%M%S%3f").to_string())
    }

    /// Wrap an identifier read back from storage
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of source system a job extracts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Cloud data warehouse (Redshift)
    Warehouse,
    /// CRM (Salesforce)
    Crm,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Warehouse => "warehouse",
            SourceKind::Crm => "crm",
        }
    }

    /// Default staging table prefix for jobs that do not name a target
    pub fn default_target_prefix(&self) -> &'static str {
        match self {
            SourceKind::Warehouse => "stg_",
            SourceKind::Crm => "stg_sf_",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "warehouse" | "redshift" => Ok(SourceKind::Warehouse),
            "crm" | "salesforce" => Ok(SourceKind::Crm),
            other => Err(EtlError::configuration(format!("unknown source kind '{other}'"))),
        }
    }
}

/// Reference to externally owned query text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryRef(PathBuf);

impl QueryRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    /// Name used to key fake outputs and log lines
    pub fn display_name(&self) -> String {
        self.0.display().to_string()
    }

    /// Read the query text
    ///
    /// Unreadable or blank query content is a query failure for the job,
    /// not a fatal error for the run.
    pub fn load(&self) -> Result<String> {
        let text = std::fs::read_to_string(&self.0).map_err(|e| {
            EtlError::query(format!("failed to read query '{}': {e}", self.0.display()))
        })?;

        if text.trim().is_empty() {
            return Err(EtlError::query(format!("query '{}' is empty", self.0.display())));
        }

        Ok(text)
    }
}

/// One configured extraction task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub source_kind: SourceKind,
    pub query_ref: QueryRef,
    pub target: String,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        source_kind: SourceKind,
        query_ref: QueryRef,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_kind,
            query_ref,
            target: target.into(),
        }
    }
}

/// Tabular rows returned by a source connector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryOutput {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Audit values written onto every staged row of a load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStamp {
    pub batch_id: BatchId,
    pub extracted_at: DateTime<Utc>,
}

impl BatchStamp {
    pub fn new(batch_id: BatchId, extracted_at: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            extracted_at,
        }
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Terminal status implied by a complete set of job results
    ///
    /// No results at all means nothing was extracted, which counts as failed.
    pub fn from_results(results: &[JobResult]) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        match succeeded {
            0 => RunStatus::Failed,
            n if n == results.len() => RunStatus::Succeeded,
            _ => RunStatus::Partial,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(EtlError::ledger_write(format!("unknown run status '{other}'"))),
        }
    }
}

/// States of the orchestrator's run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Clearing,
    ExtractingLoading,
    Finalizing,
    DoneSuccess,
    DonePartial,
    DoneFailed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Init => "init",
            RunPhase::Clearing => "clearing",
            RunPhase::ExtractingLoading => "extracting_loading",
            RunPhase::Finalizing => "finalizing",
            RunPhase::DoneSuccess => "done_success",
            RunPhase::DonePartial => "done_partial",
            RunPhase::DoneFailed => "done_failed",
        }
    }

    pub fn terminal_for(status: RunStatus) -> Self {
        match status {
            RunStatus::Succeeded => RunPhase::DoneSuccess,
            RunStatus::Partial => RunPhase::DonePartial,
            RunStatus::Failed | RunStatus::Running => RunPhase::DoneFailed,
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub batch_id: BatchId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_summary: Option<String>,
}

impl Run {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            batch_id: BatchId::from_timestamp(started_at),
            started_at,
            ended_at: None,
            status: RunStatus::Running,
            error_summary: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Close the run with its terminal status
    ///
    /// A fatal error forces `Failed`; otherwise the status follows the job
    /// results. Returns `false` and leaves the run untouched if it was
    /// already closed.
    pub fn close(
        &mut self,
        ended_at: DateTime<Utc>,
        results: &[JobResult],
        fatal: Option<&EtlError>,
    ) -> bool {
        if self.is_closed() {
            return false;
        }

        self.ended_at = Some(ended_at);
        match fatal {
            Some(err) => {
                self.status = RunStatus::Failed;
                self.error_summary = Some(err.to_string());
            },
            None => {
                self.status = RunStatus::from_results(results);
                self.error_summary = summarize_failures(results);
            },
        }
        true
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

fn summarize_failures(results: &[JobResult]) -> Option<String> {
    let failures: Vec<String> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| {
            format!(
                "{}: {}",
                r.job_name,
                r.error_detail.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();

    if failures.is_empty() {
        None
    } else {
        Some(failures.join("; "))
    }
}

/// Outcome of a single job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobOutcome {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "succeeded" => Ok(JobOutcome::Succeeded),
            "failed" => Ok(JobOutcome::Failed),
            other => Err(EtlError::ledger_write(format!("unknown job outcome '{other}'"))),
        }
    }
}

/// Result of executing one job within one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_name: String,
    pub batch_id: BatchId,
    pub source_kind: SourceKind,
    pub target: String,
    pub rows_queried: u64,
    pub rows_inserted: u64,
    pub outcome: JobOutcome,
    pub error_kind: Option<ErrorKind>,
    /// Present iff the job failed
    pub error_detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl JobResult {
    pub fn succeeded(
        job: &Job,
        batch_id: &BatchId,
        rows_queried: u64,
        rows_inserted: u64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_name: job.name.clone(),
            batch_id: batch_id.clone(),
            source_kind: job.source_kind,
            target: job.target.clone(),
            rows_queried,
            rows_inserted,
            outcome: JobOutcome::Succeeded,
            error_kind: None,
            error_detail: None,
            started_at,
            ended_at,
        }
    }

    pub fn failed(
        job: &Job,
        batch_id: &BatchId,
        rows_queried: u64,
        error: &EtlError,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_name: job.name.clone(),
            batch_id: batch_id.clone(),
            source_kind: job.source_kind,
            target: job.target.clone(),
            rows_queried,
            rows_inserted: error.committed_rows(),
            outcome: JobOutcome::Failed,
            error_kind: Some(error.kind()),
            error_detail: Some(error.to_string()),
            started_at,
            ended_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Succeeded
    }

    /// Inserted rows as a percentage of queried rows
    pub fn success_rate(&self) -> f64 {
        if self.rows_queried == 0 {
            return 0.0;
        }
        self.rows_inserted as f64 / self.rows_queried as f64 * 100.0
    }
}

/// A closed run together with its per-job breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: Run,
    pub results: Vec<JobResult>,
}

impl RunSummary {
    pub fn new(run: Run, results: Vec<JobResult>) -> Self {
        Self { run, results }
    }

    pub fn rows_queried_total(&self) -> u64 {
        self.results.iter().map(|r| r.rows_queried).sum()
    }

    pub fn rows_inserted_total(&self) -> u64 {
        self.results.iter().map(|r| r.rows_inserted).sum()
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    pub fn result(&self, job_name: &str) -> Option<&JobResult> {
        self.results.iter().find(|r| r.job_name == job_name)
    }
}

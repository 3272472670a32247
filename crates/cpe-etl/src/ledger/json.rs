//! Per-run metrics files
//!
//! One `etl_metrics_<batch_id>.json` per run, grouping job counts by source
//! the way downstream reporting reads them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{ensure_closed, ExecutionLedger};
use crate::error::{EtlError, Result};
use crate::model::{BatchId, JobOutcome, JobResult, Run, RunStatus, RunSummary};

const FILE_PREFIX: &str = "etl_metrics_";
const FILE_SUFFIX: &str = ".json";

/// Counts for one job, keyed under its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub rows_queried: u64,
    pub rows_inserted: u64,
    pub outcome: JobOutcome,
}

/// Run-wide totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsTotals {
    pub total_queried: u64,
    pub total_inserted: u64,
}

/// On-disk layout of a metrics file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsFile {
    pub batch_id: BatchId,
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    pub sources: BTreeMap<String, BTreeMap<String, JobMetrics>>,
    pub summary: MetricsTotals,
    /// Full per-job breakdown in execution order
    pub jobs: Vec<JobResult>,
}

impl MetricsFile {
    pub fn from_summary(summary: &RunSummary) -> Self {
        let mut sources: BTreeMap<String, BTreeMap<String, JobMetrics>> = BTreeMap::new();
        for result in &summary.results {
            sources
                .entry(result.source_kind.as_str().to_string())
                .or_default()
                .insert(
                    result.job_name.clone(),
                    JobMetrics {
                        rows_queried: result.rows_queried,
                        rows_inserted: result.rows_inserted,
                        outcome: result.outcome,
                    },
                );
        }

        Self {
            batch_id: summary.run.batch_id.clone(),
            timestamp: summary.run.started_at,
            status: summary.run.status,
            ended_at: summary.run.ended_at,
            error_summary: summary.run.error_summary.clone(),
            sources,
            summary: MetricsTotals {
                total_queried: summary.rows_queried_total(),
                total_inserted: summary.rows_inserted_total(),
            },
            jobs: summary.results.clone(),
        }
    }

    pub fn into_summary(self) -> RunSummary {
        let run = Run {
            batch_id: self.batch_id,
            started_at: self.timestamp,
            ended_at: self.ended_at,
            status: self.status,
            error_summary: self.error_summary,
        };
        RunSummary::new(run, self.jobs)
    }
}

/// Ledger that writes one JSON file per run into a directory
#[derive(Debug, Clone)]
pub struct JsonMetricsLedger {
    dir: PathBuf,
}

impl JsonMetricsLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, batch_id: &BatchId) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", batch_id.as_str()))
    }

    fn read(path: &Path) -> Result<RunSummary> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EtlError::ledger_write(format!("Failed to read '{}': {e}", path.display()))
        })?;
        let file: MetricsFile = serde_json::from_str(&content).map_err(|e| {
            EtlError::ledger_write(format!("Failed to parse '{}': {e}", path.display()))
        })?;
        Ok(file.into_summary())
    }

    /// Batch identifiers of every metrics file in the directory
    fn batch_ids(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EtlError::ledger_write(format!(
                    "Failed to list '{}': {e}",
                    self.dir.display()
                )))
            },
        };

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl ExecutionLedger for JsonMetricsLedger {
    async fn record(&self, run: &Run, results: &[JobResult]) -> Result<()> {
        ensure_closed(run)?;
        let file = MetricsFile::from_summary(&RunSummary::new(run.clone(), results.to_vec()));
        let body = serde_json::to_vec_pretty(&file)
            .map_err(|e| EtlError::ledger_write(format!("Failed to serialize metrics: {e}")))?;

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            EtlError::ledger_write(format!("Failed to create '{}': {e}", self.dir.display()))
        })?;

        let path = self.path_for(&run.batch_id);
        let mut out = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                EtlError::ledger_write(format!("Failed to create '{}': {e}", path.display()))
            })?;
        out.write_all(&body)
            .and_then(|_| out.sync_all())
            .map_err(|e| EtlError::ledger_write(format!("Failed to write '{}': {e}", path.display())))?;

        info!("Metrics saved to {}", path.display());
        Ok(())
    }

    async fn latest_summary(&self) -> Result<Option<RunSummary>> {
        let Some(latest) = self.batch_ids()?.into_iter().max() else {
            return Ok(None);
        };
        Self::read(&self.path_for(&BatchId::new(latest))).map(Some)
    }

    async fn summary(&self, batch_id: &BatchId) -> Result<Option<RunSummary>> {
        let path = self.path_for(batch_id);
        if !path.exists() {
            return Ok(None);
        }
        match Self::read(&path) {
            Ok(summary) => Ok(Some(summary)),
            Err(e) => {
                warn!("Unreadable metrics file {}: {}", path.display(), e);
                Err(e)
            },
        }
    }
}

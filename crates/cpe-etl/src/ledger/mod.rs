//! Execution ledger
//!
//! Durable, append-only record of closed runs. A ledger never updates a run
//! it has already recorded. Write failures are reported to the caller, which
//! logs them without changing the run's outcome.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::error::{EtlError, Result};
use crate::model::{BatchId, JobResult, Run, RunSummary};

pub mod json;
pub mod schema;
pub mod sqlite;

pub use json::JsonMetricsLedger;
pub use sqlite::SqliteLedger;

/// Persistent store of run outcomes
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Persist a closed run and its job results
    async fn record(&self, run: &Run, results: &[JobResult]) -> Result<()>;

    /// Most recently started run, if any
    async fn latest_summary(&self) -> Result<Option<RunSummary>>;

    async fn summary(&self, batch_id: &BatchId) -> Result<Option<RunSummary>>;
}

/// Reject runs that are still open
pub(crate) fn ensure_closed(run: &Run) -> Result<()> {
    if run.is_closed() && run.status.is_terminal() {
        Ok(())
    } else {
        Err(EtlError::ledger_write(format!(
            "run {} is still running",
            run.batch_id
        )))
    }
}

/// Records to every inner ledger
///
/// Every ledger is attempted; the record fails if any of them failed. Reads
/// come from the first ledger that can answer.
#[derive(Clone, Default)]
pub struct FanoutLedger {
    ledgers: Vec<Arc<dyn ExecutionLedger>>,
}

impl FanoutLedger {
    pub fn new(ledgers: Vec<Arc<dyn ExecutionLedger>>) -> Self {
        Self { ledgers }
    }

    pub fn with(mut self, ledger: Arc<dyn ExecutionLedger>) -> Self {
        self.ledgers.push(ledger);
        self
    }
}

#[async_trait]
impl ExecutionLedger for FanoutLedger {
    async fn record(&self, run: &Run, results: &[JobResult]) -> Result<()> {
        let mut failures = Vec::new();
        for ledger in &self.ledgers {
            if let Err(e) = ledger.record(run, results).await {
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EtlError::ledger_write(failures.join("; ")))
        }
    }

    async fn latest_summary(&self) -> Result<Option<RunSummary>> {
        let mut last_error = None;
        for ledger in &self.ledgers {
            match ledger.latest_summary().await {
                Ok(Some(summary)) => return Ok(Some(summary)),
                Ok(None) => {},
                Err(e) => {
                    warn!("Ledger read failed, trying next: {}", e);
                    last_error = Some(e);
                },
            }
        }
        last_error.map_or(Ok(None), Err)
    }

    async fn summary(&self, batch_id: &BatchId) -> Result<Option<RunSummary>> {
        let mut last_error = None;
        for ledger in &self.ledgers {
            match ledger.summary(batch_id).await {
                Ok(Some(summary)) => return Ok(Some(summary)),
                Ok(None) => {},
                Err(e) => {
                    warn!("Ledger read failed, trying next: {}", e);
                    last_error = Some(e);
                },
            }
        }
        last_error.map_or(Ok(None), Err)
    }
}

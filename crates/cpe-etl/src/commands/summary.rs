//! `cpe-etl summary` command implementation

use colored::Colorize;
use std::sync::Arc;

use super::print_summary;
use crate::error::Result;
use crate::ledger::{ExecutionLedger, FanoutLedger, JsonMetricsLedger, SqliteLedger};
use crate::model::BatchId;
use crate::settings::{EtlSettings, RunSettings};

/// Show the latest run, or the run with `batch_id`
pub async fn run(batch_id: Option<&str>) -> Result<()> {
    let settings = EtlSettings::from_env()?;
    let ledger = open_ledger(&settings.run)?;

    let summary = match batch_id {
        Some(id) => ledger.summary(&BatchId::new(id)).await?,
        None => ledger.latest_summary().await?,
    };

    match summary {
        Some(summary) => print_summary(&summary),
        None => match batch_id {
            Some(id) => println!("{} No run recorded for batch {}", "→".cyan(), id),
            None => println!("{} No runs recorded yet", "→".cyan()),
        },
    }

    Ok(())
}

/// Read-side ledger: SQLite first, metrics files as fallback
///
/// The SQLite file is only opened when it exists, so reading never creates
/// an empty ledger.
pub fn open_ledger(settings: &RunSettings) -> Result<FanoutLedger> {
    let mut ledger = FanoutLedger::default();
    if settings.ledger_path.exists() {
        ledger = ledger.with(Arc::new(SqliteLedger::open(&settings.ledger_path)?));
    }
    Ok(ledger.with(Arc::new(JsonMetricsLedger::new(&settings.metrics_dir))))
}

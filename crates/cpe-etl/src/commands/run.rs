//! `cpe-etl run` command implementation
//!
//! Wires the orchestrator to production systems, or to in-memory fakes with
//! `--manual`, executes one run and returns the process exit code.

use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::print_summary;
use crate::connector::{ConnectorSet, CrmConnector, FakeConnector, WarehouseConnector};
use crate::error::{EtlError, Result};
use crate::lease::{FileRunLease, InProcessRunLease};
use crate::ledger::{FanoutLedger, JsonMetricsLedger, SqliteLedger};
use crate::model::SourceKind;
use crate::notify::{CompositeNotifier, LogNotifier, MarkdownReportNotifier};
use crate::orchestrator::{Orchestrator, RunOptions, RunReport};
use crate::registry::{JobRegistry, JobsFile};
use crate::settings::EtlSettings;
use crate::staging::{MemoryStagingStore, PgStagingStore};

/// Execute one run and return its exit code
pub async fn run(config: &Path, manual: bool) -> Result<i32> {
    let orchestrator = if manual {
        info!("Running in manual mode (fake sources, in-memory staging)");
        manual_orchestrator(config)?
    } else {
        production_orchestrator().await?
    };

    let report = orchestrator.run_config(config).await;
    print_report(&report);
    Ok(report.exit_code())
}

/// Orchestrator backed by fakes only
///
/// The staging store starts with an empty table for every target the
/// configuration names. A configuration that cannot be read leaves the store
/// empty; the run itself then records the failure.
pub fn manual_orchestrator(config: &Path) -> Result<Orchestrator> {
    let store = MemoryStagingStore::new();
    match JobsFile::load(config).and_then(|file| JobRegistry::from_config(&file)) {
        Ok(registry) => {
            for target in registry.targets() {
                store.add_target(target);
            }
        },
        Err(e) => warn!(error = %e, "Could not pre-seed staging targets"),
    }

    let connectors = ConnectorSet::new()
        .with(Arc::new(FakeConnector::new(SourceKind::Warehouse)))
        .with(Arc::new(FakeConnector::new(SourceKind::Crm)));

    Ok(Orchestrator::new(
        connectors,
        Arc::new(store),
        Arc::new(SqliteLedger::in_memory()?),
    )
    .with_lease(Arc::new(InProcessRunLease::new())))
}

/// Orchestrator wired to Redshift, Salesforce and the staging database
async fn production_orchestrator() -> Result<Orchestrator> {
    let settings = EtlSettings::from_env()?;

    let missing = settings.verify_credentials();
    if !missing.is_empty() {
        return Err(EtlError::configuration(format!(
            "missing credentials: {}",
            missing.join(", ")
        )));
    }

    let connectors = ConnectorSet::new()
        .with(Arc::new(WarehouseConnector::from_settings(&settings.warehouse)?))
        .with(Arc::new(CrmConnector::from_settings(&settings.crm)?));

    let store = PgStagingStore::connect(&settings.staging, settings.run.load_batch_size).await?;

    let ledger = FanoutLedger::new(vec![
        Arc::new(SqliteLedger::open(&settings.run.ledger_path)?),
        Arc::new(JsonMetricsLedger::new(&settings.run.metrics_dir)),
    ]);

    let notifier = CompositeNotifier::new()
        .with(Arc::new(LogNotifier))
        .with(Arc::new(MarkdownReportNotifier::new(&settings.run.metrics_dir)));

    let lease = FileRunLease::new(&settings.run.lock_path, settings.run.lock_stale_after());

    Ok(Orchestrator::new(connectors, Arc::new(store), Arc::new(ledger))
        .with_notifier(Arc::new(notifier))
        .with_lease(Arc::new(lease))
        .with_options(RunOptions::from(&settings.run)))
}

fn print_report(report: &RunReport) {
    println!();
    print_summary(&report.summary);

    if let Some(e) = &report.ledger_error {
        println!("  {} {}", "Ledger:".yellow(), e);
    }
    if let Some(e) = &report.notification_error {
        println!("  {} {}", "Notification:".yellow(), e);
    }
}

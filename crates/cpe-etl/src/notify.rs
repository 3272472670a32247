//! Notification gateway
//!
//! Receives the closed run summary once the ledger has been written. A
//! delivery failure is reported but never turns into an ETL failure.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{EtlError, Result};
use crate::model::{RunStatus, RunSummary};

/// Delivers a run summary to humans
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn deliver(&self, summary: &RunSummary) -> Result<()>;
}

/// Writes the summary to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationGateway for LogNotifier {
    async fn deliver(&self, summary: &RunSummary) -> Result<()> {
        let run = &summary.run;
        info!(
            batch_id = %run.batch_id,
            status = %run.status,
            rows_queried = summary.rows_queried_total(),
            rows_inserted = summary.rows_inserted_total(),
            duration_secs = run.duration_secs().unwrap_or_default(),
            "ETL run {} finished: {}",
            run.batch_id,
            run.status
        );

        for result in &summary.results {
            match &result.error_detail {
                None => info!(
                    "  {} / {}: {} queried, {} inserted",
                    result.source_kind, result.job_name, result.rows_queried, result.rows_inserted
                ),
                Some(detail) => warn!(
                    "  {} / {}: FAILED after {} queried, {} inserted: {}",
                    result.source_kind,
                    result.job_name,
                    result.rows_queried,
                    result.rows_inserted,
                    detail
                ),
            }
        }

        if run.status == RunStatus::Failed {
            if let Some(summary) = &run.error_summary {
                warn!("Run failed: {}", summary);
            }
        }
        Ok(())
    }
}

/// Delivers to several gateways in order
///
/// Every gateway is attempted; delivery fails if any of them failed.
#[derive(Clone, Default)]
pub struct CompositeNotifier {
    gateways: Vec<Arc<dyn NotificationGateway>>,
}

impl CompositeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, gateway: Arc<dyn NotificationGateway>) -> Self {
        self.gateways.push(gateway);
        self
    }
}

#[async_trait]
impl NotificationGateway for CompositeNotifier {
    async fn deliver(&self, summary: &RunSummary) -> Result<()> {
        let mut failures = Vec::new();
        for gateway in &self.gateways {
            if let Err(e) = gateway.deliver(summary).await {
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EtlError::notification(failures.join("; ")))
        }
    }
}

/// Writes a Markdown metrics table per run into a directory
#[derive(Debug, Clone)]
pub struct MarkdownReportNotifier {
    dir: PathBuf,
}

impl MarkdownReportNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, summary: &RunSummary) -> PathBuf {
        self.dir
            .join(format!("etl_report_{}.md", summary.run.batch_id.as_str()))
    }
}

#[async_trait]
impl NotificationGateway for MarkdownReportNotifier {
    async fn deliver(&self, summary: &RunSummary) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            EtlError::notification(format!("failed to create '{}': {e}", self.dir.display()))
        })?;

        let path = self.path_for(summary);
        std::fs::write(&path, render_markdown(summary)).map_err(|e| {
            EtlError::notification(format!("failed to write '{}': {e}", path.display()))
        })?;

        info!("Metrics report written to {}", path.display());
        Ok(())
    }
}

/// Markdown metrics table with run totals
pub fn render_markdown(summary: &RunSummary) -> String {
    let run = &summary.run;
    let mut md = String::new();

    let _ = writeln!(md, "# ETL Run {}", run.batch_id);
    let _ = writeln!(md);
    let _ = writeln!(md, "Status: {}", run.status);
    let _ = writeln!(
        md,
        "Total Rows Queried: {}",
        group_thousands(summary.rows_queried_total())
    );
    let _ = writeln!(
        md,
        "Total Rows Inserted: {}",
        group_thousands(summary.rows_inserted_total())
    );
    let _ = writeln!(md);
    let _ = writeln!(
        md,
        "| Source | Query/Table | Rows Queried | Rows Inserted | Success Rate |"
    );
    let _ = writeln!(
        md,
        "|--------|-------------|--------------|---------------|--------------|"
    );

    for result in &summary.results {
        let _ = writeln!(
            md,
            "| {} | {} | {} | {} | {:.1}% |",
            result.source_kind,
            result.job_name,
            group_thousands(result.rows_queried),
            group_thousands(result.rows_inserted),
            result.success_rate()
        );
    }

    let failures: Vec<_> = summary.failed_jobs().collect();
    if !failures.is_empty() {
        let _ = writeln!(md);
        let _ = writeln!(md, "## Failures");
        let _ = writeln!(md);
        for result in failures {
            let _ = writeln!(
                md,
                "- {}: {}",
                result.job_name,
                result.error_detail.as_deref().unwrap_or("unknown error")
            );
        }
    }

    md
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

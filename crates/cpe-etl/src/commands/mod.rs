//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod run;
pub mod summary;
pub mod verify;

use colored::Colorize;

use crate::model::{JobOutcome, RunStatus, RunSummary};

/// Print a run summary for humans
pub fn print_summary(summary: &RunSummary) {
    let run = &summary.run;
    let status = match run.status {
        RunStatus::Succeeded => run.status.as_str().green().bold(),
        RunStatus::Partial => run.status.as_str().yellow().bold(),
        RunStatus::Failed | RunStatus::Running => run.status.as_str().red().bold(),
    };

    println!("{} {}", "ETL run".cyan().bold(), run.batch_id);
    println!("  {} {}", "Status:".cyan(), status);
    println!(
        "  {} {}",
        "Started:".cyan(),
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(ended_at) = run.ended_at {
        println!(
            "  {} {} ({:.1}s)",
            "Ended:".cyan(),
            ended_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.duration_secs().unwrap_or_default()
        );
    }
    println!();

    for result in &summary.results {
        let marker = match result.outcome {
            JobOutcome::Succeeded => "✓".green(),
            JobOutcome::Failed => "✗".red(),
        };
        println!(
            "{} {} / {} -> {}: {} queried, {} inserted",
            marker,
            result.source_kind,
            result.job_name,
            result.target,
            result.rows_queried,
            result.rows_inserted
        );
        if let Some(detail) = &result.error_detail {
            println!("    {}", detail.dimmed());
        }
    }

    if !summary.results.is_empty() {
        println!();
    }
    println!(
        "  {} {} queried, {} inserted",
        "Totals:".cyan(),
        summary.rows_queried_total(),
        summary.rows_inserted_total()
    );
    if let Some(error_summary) = &run.error_summary {
        println!("  {} {}", "Errors:".cyan(), error_summary.red());
    }
}

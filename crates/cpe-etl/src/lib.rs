//! Commission Preview ETL
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Nightly batch that refreshes the commission preview staging tables from
//! the data warehouse and the CRM.
//!
//! # Overview
//!
//! A run moves through a fixed sequence of phases:
//!
//! - **Init**: take the staging lease, load the job registry, check every
//!   target table exists
//! - **Clearing**: truncate each distinct target once
//! - **Extracting/loading**: run each job's query and bulk-load the rows,
//!   stamped with the run's batch ID; a failing job never stops the others
//! - **Finalizing**: close the run as succeeded, partial or failed, record
//!   it in the execution ledger and deliver the summary
//!
//! Source systems, the staging store, the ledger and the notification
//! channel are traits, so the same [`Orchestrator`] drives production
//! connectors and in-memory fakes.

pub mod clock;
pub mod commands;
pub mod connector;
pub mod error;
pub mod lease;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod registry;
pub mod settings;
pub mod staging;

// Re-export commonly used types
pub use error::{ErrorKind, EtlError, Result};
pub use model::{BatchId, Job, JobResult, Run, RunStatus, RunSummary, SourceKind};
pub use orchestrator::{Orchestrator, RunOptions, RunReport};
pub use registry::JobRegistry;
pub use settings::EtlSettings;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Commission Preview ETL
#[derive(Parser, Debug)]
#[command(name = "cpe-etl")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute one ETL run
    Run {
        /// Job configuration file
        #[arg(short, long, env = "ETL_CONFIG", default_value = "config.yml")]
        config: PathBuf,

        /// Dry run against fake sources and an in-memory staging store
        #[arg(long)]
        manual: bool,
    },

    /// Print the latest (or a given) run summary from the ledger
    Summary {
        /// Batch ID to show
        #[arg(short, long)]
        batch_id: Option<String>,
    },

    /// List missing credential variables
    VerifyCredentials,
}

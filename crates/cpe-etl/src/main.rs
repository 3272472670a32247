//! Commission Preview ETL - Main entry point

use cpe_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use cpe_etl::{commands, Cli, Commands};
use clap::Parser;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .output(LogOutput::Both)
        .log_dir("./logs")
        .log_file_prefix("cpe-etl")
        .filter_directives("sqlx=warn,hyper=warn,reqwest=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env().unwrap_or_else(|e| {
        eprintln!("Warning: ignoring invalid logging environment: {}", e);
        LogConfig::builder().level(log_level).build()
    });

    // The guard flushes the file writer on exit
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    let code = match execute_command(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        },
    };

    drop(guard);
    process::exit(code);
}

/// Execute the CLI command and return the process exit code
async fn execute_command(cli: &Cli) -> anyhow::Result<i32> {
    let code = match &cli.command {
        Commands::Run { config, manual } => commands::run::run(config, *manual).await?,
        Commands::Summary { batch_id } => {
            commands::summary::run(batch_id.as_deref()).await?;
            0
        },
        Commands::VerifyCredentials => commands::verify::run().await?,
    };
    Ok(code)
}

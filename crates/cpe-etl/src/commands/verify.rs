//! `cpe-etl verify-credentials` command implementation

use colored::Colorize;

use crate::error::Result;
use crate::settings::EtlSettings;

/// Report missing credential variables; exit code 1 if any are missing
pub async fn run() -> Result<i32> {
    let settings = EtlSettings::from_env()?;
    let missing = settings.verify_credentials();

    if missing.is_empty() {
        println!("{} All required credentials are set", "✓".green());
        return Ok(0);
    }

    println!("{} Missing credentials:", "✗".red());
    for name in &missing {
        println!("  - {}", name);
    }
    Ok(1)
}

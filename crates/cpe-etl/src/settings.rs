//! Runtime settings and credentials
//!
//! Everything is read from the environment, optionally seeded from a `.env`
//! file. Missing credentials are not an error at load time; the CLI asks
//! [`EtlSettings::verify_credentials`] before opening any connection.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EtlError, Result};

// ============================================================================
// Defaults
// ============================================================================

/// Default Redshift port.
pub const DEFAULT_REDSHIFT_PORT: u16 = 5439;

/// Default Salesforce login endpoint.
pub const DEFAULT_SF_LOGIN_URL: &str = "https://login.salesforce.com";

/// Default Salesforce REST API version.
pub const DEFAULT_SF_API_VERSION: &str = "v59.0";

/// Default maximum staging pool connections.
pub const DEFAULT_STAGING_MAX_CONNECTIONS: u32 = 5;

/// Default per-call connector timeout (30 minutes).
pub const DEFAULT_CONNECTOR_TIMEOUT_SECS: u64 = 1800;

/// Default rows per staging insert statement.
pub const DEFAULT_LOAD_BATCH_SIZE: usize = 2000;

/// Default number of jobs run at once.
pub const DEFAULT_MAX_PARALLEL_JOBS: usize = 1;

/// Default SQLite ledger location.
pub const DEFAULT_LEDGER_PATH: &str = "./metrics/etl_ledger.db";

/// Default directory for per-run metrics files.
pub const DEFAULT_METRICS_DIR: &str = "./metrics";

/// Default run lock file.
pub const DEFAULT_LOCK_PATH: &str = "./etl.lock";

/// Default age after which a lock file is considered abandoned (6 hours).
pub const DEFAULT_LOCK_STALE_SECS: u64 = 21_600;

/// Redshift connection settings
#[derive(Clone, Serialize, Deserialize)]
pub struct WarehouseSettings {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl std::fmt::Debug for WarehouseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}

/// Salesforce connection settings
#[derive(Clone, Serialize, Deserialize)]
pub struct CrmSettings {
    pub username: Option<String>,
    pub password: Option<String>,
    pub security_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub login_url: String,
    pub api_version: String,
}

impl std::fmt::Debug for CrmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrmSettings")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("security_token", &self.security_token.as_ref().map(|_| "***"))
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("login_url", &self.login_url)
            .field("api_version", &self.api_version)
            .finish()
    }
}

/// Staging database settings
#[derive(Clone, Serialize, Deserialize)]
pub struct StagingSettings {
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl std::fmt::Debug for StagingSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingSettings")
            .field("database_url", &self.database_url.as_ref().map(|_| "***"))
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Run-level knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub connector_timeout_secs: u64,
    pub load_batch_size: usize,
    pub max_parallel_jobs: usize,
    pub ledger_path: PathBuf,
    pub metrics_dir: PathBuf,
    pub lock_path: PathBuf,
    pub lock_stale_secs: u64,
}

impl RunSettings {
    pub fn connector_timeout(&self) -> Duration {
        Duration::from_secs(self.connector_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}

/// Complete ETL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlSettings {
    pub warehouse: WarehouseSettings,
    pub crm: CrmSettings,
    pub staging: StagingSettings,
    pub run: RunSettings,
}

impl EtlSettings {
    /// Load settings from the process environment, reading `.env` first
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::warn!(error = %e, "No .env file loaded, using process environment");
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let settings = Self {
            warehouse: WarehouseSettings {
                host: var("REDSHIFT_HOST"),
                port: parse_or(&var, "REDSHIFT_PORT", DEFAULT_REDSHIFT_PORT)?,
                user: var("REDSHIFT_USER"),
                password: var("REDSHIFT_PASSWORD"),
                database: var("REDSHIFT_DATABASE"),
            },
            crm: CrmSettings {
                username: var("SF_USERNAME"),
                password: var("SF_PASSWORD"),
                security_token: var("SF_SECURITY_TOKEN"),
                client_id: var("SF_CLIENT_ID"),
                client_secret: var("SF_CLIENT_SECRET"),
                login_url: var("SF_LOGIN_URL").unwrap_or_else(|| DEFAULT_SF_LOGIN_URL.to_string()),
                api_version: var("SF_API_VERSION")
                    .unwrap_or_else(|| DEFAULT_SF_API_VERSION.to_string()),
            },
            staging: StagingSettings {
                database_url: var("STAGING_DATABASE_URL"),
                max_connections: parse_or(
                    &var,
                    "STAGING_MAX_CONNECTIONS",
                    DEFAULT_STAGING_MAX_CONNECTIONS,
                )?,
            },
            run: RunSettings {
                connector_timeout_secs: parse_or(
                    &var,
                    "ETL_CONNECTOR_TIMEOUT_SECS",
                    DEFAULT_CONNECTOR_TIMEOUT_SECS,
                )?,
                load_batch_size: parse_or(&var, "ETL_LOAD_BATCH_SIZE", DEFAULT_LOAD_BATCH_SIZE)?,
                max_parallel_jobs: parse_or(
                    &var,
                    "ETL_MAX_PARALLEL_JOBS",
                    DEFAULT_MAX_PARALLEL_JOBS,
                )?,
                ledger_path: var("ETL_LEDGER_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_PATH)),
                metrics_dir: var("ETL_METRICS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_METRICS_DIR)),
                lock_path: var("ETL_LOCK_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_PATH)),
                lock_stale_secs: parse_or(&var, "ETL_LOCK_STALE_SECS", DEFAULT_LOCK_STALE_SECS)?,
            },
        };

        settings.validate()?;

        Ok(settings)
    }

    /// Validate the numeric knobs
    pub fn validate(&self) -> Result<()> {
        if self.run.connector_timeout_secs == 0 {
            return Err(EtlError::configuration(
                "ETL_CONNECTOR_TIMEOUT_SECS must be greater than 0",
            ));
        }

        if self.run.load_batch_size == 0 {
            return Err(EtlError::configuration("ETL_LOAD_BATCH_SIZE must be greater than 0"));
        }

        if self.run.max_parallel_jobs == 0 {
            return Err(EtlError::configuration("ETL_MAX_PARALLEL_JOBS must be greater than 0"));
        }

        if self.staging.max_connections == 0 {
            return Err(EtlError::configuration(
                "STAGING_MAX_CONNECTIONS must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Names of required credential variables that are not set
    pub fn verify_credentials(&self) -> Vec<&'static str> {
        let required: [(&'static str, bool); 8] = [
            ("REDSHIFT_HOST", self.warehouse.host.is_some()),
            ("REDSHIFT_USER", self.warehouse.user.is_some()),
            ("REDSHIFT_PASSWORD", self.warehouse.password.is_some()),
            ("REDSHIFT_DATABASE", self.warehouse.database.is_some()),
            ("SF_USERNAME", self.crm.username.is_some()),
            ("SF_PASSWORD", self.crm.password.is_some()),
            ("SF_SECURITY_TOKEN", self.crm.security_token.is_some()),
            ("STAGING_DATABASE_URL", self.staging.database_url.is_some()),
        ];

        required
            .into_iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| name)
            .collect()
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EtlError::configuration(format!("invalid {key} '{raw}': {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let settings = EtlSettings::from_lookup(lookup(&[])).unwrap();

        assert_eq!(settings.warehouse.port, DEFAULT_REDSHIFT_PORT);
        assert_eq!(settings.crm.login_url, DEFAULT_SF_LOGIN_URL);
        assert_eq!(settings.crm.api_version, DEFAULT_SF_API_VERSION);
        assert_eq!(settings.run.load_batch_size, 2000);
        assert_eq!(settings.run.max_parallel_jobs, 1);
        assert_eq!(settings.run.connector_timeout(), Duration::from_secs(1800));
        assert_eq!(settings.run.ledger_path, PathBuf::from(DEFAULT_LEDGER_PATH));
    }

    #[test]
    fn test_verify_credentials_lists_missing_variables() {
        let settings = EtlSettings::from_lookup(lookup(&[
            ("REDSHIFT_HOST", "warehouse.example.com"),
            ("REDSHIFT_USER", "etl"),
            ("REDSHIFT_PASSWORD", "secret"),
            ("REDSHIFT_DATABASE", "dev"),
            ("SF_USERNAME", "etl@example.com"),
            ("SF_PASSWORD", ""),
        ]))
        .unwrap();

        assert_eq!(
            settings.verify_credentials(),
            vec!["SF_PASSWORD", "SF_SECURITY_TOKEN", "STAGING_DATABASE_URL"]
        );
    }

    #[test]
    fn test_invalid_numbers_are_configuration_errors() {
        let err = EtlSettings::from_lookup(lookup(&[("ETL_LOAD_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("ETL_LOAD_BATCH_SIZE"));

        let err = EtlSettings::from_lookup(lookup(&[("ETL_MAX_PARALLEL_JOBS", "0")])).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_debug_output_masks_secrets() {
        let settings = EtlSettings::from_lookup(lookup(&[
            ("REDSHIFT_PASSWORD", "hunter2"),
            ("SF_SECURITY_TOKEN", "tok3n"),
        ]))
        .unwrap();

        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("tok3n"));
    }
}

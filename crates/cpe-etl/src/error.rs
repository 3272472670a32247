//! Error taxonomy for an ETL run
//!
//! Each variant maps to one handling policy in the orchestrator:
//!
//! - fatal before any mutation: `Configuration`, `LeaseUnavailable`
//! - fatal during preparation: `Clear`
//! - isolated to one job: `Connection`, `Query`, `Load`
//! - reported but never changes the run outcome: `LedgerWrite`, `Notification`

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Error raised anywhere in the extract/load pipeline
#[derive(Error, Debug)]
pub enum EtlError {
    /// Job registry is invalid or inconsistent with the staging store
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Source unreachable, unauthenticated, or timed out
    #[error("Connection failure: {0}")]
    Connection(String),

    /// Source rejected the query
    #[error("Query failure: {0}")]
    Query(String),

    /// Bulk load into a staging table did not complete
    ///
    /// `committed` is the number of rows already visible in the target, or
    /// `None` when the sink cannot tell.
    #[error("Load failure on '{target}' ({}): {message}", describe_committed(.committed))]
    Load {
        target: String,
        committed: Option<u64>,
        message: String,
    },

    /// Staging table could not be truncated
    #[error("Clear failure on '{target}': {message}")]
    Clear { target: String, message: String },

    /// Execution record could not be persisted
    #[error("Ledger write failure: {0}")]
    LedgerWrite(String),

    /// Another run holds the staging lease
    #[error("Run lease unavailable: {0}")]
    LeaseUnavailable(String),

    /// Notification gateway could not deliver the summary
    #[error("Notification failure: {0}")]
    Notification(String),
}

fn describe_committed(committed: &Option<u64>) -> String {
    match committed {
        Some(rows) => format!("{rows} rows committed"),
        None => "committed row count unknown".to_string(),
    }
}

impl EtlError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    pub fn load(target: impl Into<String>, committed: Option<u64>, msg: impl Into<String>) -> Self {
        Self::Load {
            target: target.into(),
            committed,
            message: msg.into(),
        }
    }

    pub fn clear(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Clear {
            target: target.into(),
            message: msg.into(),
        }
    }

    pub fn ledger_write(msg: impl Into<String>) -> Self {
        Self::LedgerWrite(msg.into())
    }

    pub fn lease_unavailable(msg: impl Into<String>) -> Self {
        Self::LeaseUnavailable(msg.into())
    }

    pub fn notification(msg: impl Into<String>) -> Self {
        Self::Notification(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EtlError::Configuration(_) => ErrorKind::Configuration,
            EtlError::Connection(_) => ErrorKind::Connection,
            EtlError::Query(_) => ErrorKind::Query,
            EtlError::Load { .. } => ErrorKind::Load,
            EtlError::Clear { .. } => ErrorKind::Clear,
            EtlError::LedgerWrite(_) => ErrorKind::LedgerWrite,
            EtlError::LeaseUnavailable(_) => ErrorKind::LeaseUnavailable,
            EtlError::Notification(_) => ErrorKind::Notification,
        }
    }

    /// Whether this error ends the whole run rather than a single job
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EtlError::Configuration(_) | EtlError::Clear { .. } | EtlError::LeaseUnavailable(_)
        )
    }

    /// Rows known to be committed by a failed load
    ///
    /// An unknown partial count is treated as nothing inserted.
    pub fn committed_rows(&self) -> u64 {
        match self {
            EtlError::Load { committed, .. } => committed.unwrap_or(0),
            _ => 0,
        }
    }
}

impl From<cpe_common::CommonError> for EtlError {
    fn from(err: cpe_common::CommonError) -> Self {
        EtlError::Configuration(err.to_string())
    }
}

/// Stable discriminant of [`EtlError`], persisted in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connection,
    Query,
    Load,
    Clear,
    LedgerWrite,
    LeaseUnavailable,
    Notification,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connection => "connection",
            ErrorKind::Query => "query",
            ErrorKind::Load => "load",
            ErrorKind::Clear => "clear",
            ErrorKind::LedgerWrite => "ledger_write",
            ErrorKind::LeaseUnavailable => "lease_unavailable",
            ErrorKind::Notification => "notification",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = EtlError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "configuration" => Ok(ErrorKind::Configuration),
            "connection" => Ok(ErrorKind::Connection),
            "query" => Ok(ErrorKind::Query),
            "load" => Ok(ErrorKind::Load),
            "clear" => Ok(ErrorKind::Clear),
            "ledger_write" => Ok(ErrorKind::LedgerWrite),
            "lease_unavailable" => Ok(ErrorKind::LeaseUnavailable),
            "notification" => Ok(ErrorKind::Notification),
            other => Err(EtlError::ledger_write(format!("unknown error kind '{other}'"))),
        }
    }
}

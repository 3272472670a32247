//! Staging store
//!
//! The store owns the staging tables. A run clears every target it will
//! write, then bulk-loads each job's rows with the run's audit stamp.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{EtlError, Result};
use crate::model::{BatchStamp, QueryOutput, BATCH_ID_COLUMN, EXTRACTED_AT_COLUMN};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStagingStore, StagedRow, StoreCall};
pub use postgres::PgStagingStore;

/// Rows between progress log lines during a bulk load
pub const PROGRESS_INTERVAL_ROWS: u64 = 20_000;

/// Single writer of staging tables
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Whether the named table exists
    async fn has_target(&self, target: &str) -> Result<bool>;

    /// Remove every row from `target`
    ///
    /// Clearing an empty table succeeds.
    async fn clear(&self, target: &str) -> Result<()>;

    /// Append `output` to `target`, stamping each row
    ///
    /// Returns the number of rows inserted. On failure the error carries the
    /// number of rows already committed, when the sink can tell.
    async fn bulk_load(&self, target: &str, output: &QueryOutput, stamp: &BatchStamp)
        -> Result<u64>;
}

/// Check a table identifier, optionally schema-qualified
pub fn validate_identifier(target: &str) -> Result<()> {
    let parts: Vec<&str> = target.split('.').collect();
    if parts.len() > 2 || parts.iter().any(|p| !is_plain_identifier(p)) {
        return Err(EtlError::configuration(format!(
            "invalid staging target '{target}'"
        )));
    }
    Ok(())
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a validated, possibly schema-qualified table name
pub fn quote_target(target: &str) -> Result<String> {
    validate_identifier(target)?;
    Ok(target
        .split('.')
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join("."))
}

/// Business columns followed by the two audit columns
///
/// A business column sharing an audit column's name is dropped; the stamp
/// wins.
pub fn staged_columns(output: &QueryOutput) -> Vec<String> {
    let mut columns: Vec<String> = output
        .columns
        .iter()
        .filter(|c| !is_audit_column(c))
        .cloned()
        .collect();
    columns.push(BATCH_ID_COLUMN.to_string());
    columns.push(EXTRACTED_AT_COLUMN.to_string());
    columns
}

fn is_audit_column(name: &str) -> bool {
    name.eq_ignore_ascii_case(BATCH_ID_COLUMN) || name.eq_ignore_ascii_case(EXTRACTED_AT_COLUMN)
}

/// Turn one positional row into a JSON object carrying the stamp
pub fn stamp_row(columns: &[String], row: &[Value], stamp: &BatchStamp) -> Map<String, Value> {
    let mut object: Map<String, Value> = columns
        .iter()
        .zip(row.iter())
        .filter(|(c, _)| !is_audit_column(c))
        .map(|(c, v)| (c.clone(), v.clone()))
        .collect();

    // Short rows are padded with nulls so every object has every column
    for column in columns.iter().skip(row.len()) {
        if !is_audit_column(column) {
            object.insert(column.clone(), Value::Null);
        }
    }

    object.insert(
        BATCH_ID_COLUMN.to_string(),
        Value::String(stamp.batch_id.to_string()),
    );
    object.insert(
        EXTRACTED_AT_COLUMN.to_string(),
        Value::String(stamp.extracted_at.to_rfc3339()),
    );
    object
}

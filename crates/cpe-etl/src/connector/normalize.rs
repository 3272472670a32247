//! Value normalisation for extracted rows
//!
//! Columns are classified by name. Currency-like columns are rounded to two
//! decimals and rate-like columns to four. On CRM rows, date-like columns
//! have ISO-8601 strings rewritten as `YYYY-MM-DD HH:MM:SS`; anything that
//! does not parse as a timestamp is kept as it came. Values that do not fit
//! the staging numeric type become null. Rows are never dropped.

use chrono::{DateTime, NaiveDateTime};
use serde_json::{Number, Value};
use tracing::warn;

use crate::model::{QueryOutput, SourceKind};

const CURRENCY_KEYWORDS: &[&str] = &[
    "amount",
    "commission",
    "billed",
    "payment",
    "profit",
    "deduction",
    "override",
];
const RATE_KEYWORDS: &[&str] = &["rate", "split"];
const DATE_KEYWORDS: &[&str] = &["date", "time", "created", "modified", "opened", "closed"];

/// Longest string still considered a candidate number
const MAX_NUMERIC_TEXT_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnClass {
    Currency,
    Rate,
    DateTime,
    Other,
}

fn classify(column: &str) -> ColumnClass {
    let name = column.to_ascii_lowercase();
    let has = |keywords: &[&str]| keywords.iter().any(|k| name.contains(k));

    if has(CURRENCY_KEYWORDS) {
        // "commission_rate" is numeric, but keeps rate precision
        if has(RATE_KEYWORDS) {
            ColumnClass::Rate
        } else {
            ColumnClass::Currency
        }
    } else if has(DATE_KEYWORDS) {
        ColumnClass::DateTime
    } else if has(RATE_KEYWORDS) {
        ColumnClass::Rate
    } else {
        ColumnClass::Other
    }
}

/// Largest absolute value accepted for a numeric column
pub fn numeric_limit(kind: SourceKind) -> f64 {
    match kind {
        SourceKind::Warehouse => 999_999_999_999.99,
        SourceKind::Crm => 999_999_999.99,
    }
}

/// Normalise every cell of `output` in place
pub fn normalize_output(kind: SourceKind, output: &mut QueryOutput) {
    let classes: Vec<ColumnClass> = output.columns.iter().map(|c| classify(c)).collect();

    for row in &mut output.rows {
        for (idx, cell) in row.iter_mut().enumerate() {
            let Some(class) = classes.get(idx) else {
                continue;
            };
            let column = &output.columns[idx];
            let value = std::mem::take(cell);
            *cell = match class {
                ColumnClass::Currency => normalize_number(kind, column, value, 2),
                ColumnClass::Rate => normalize_number(kind, column, value, 4),
                ColumnClass::DateTime if kind == SourceKind::Crm => normalize_datetime(value),
                ColumnClass::DateTime | ColumnClass::Other => value,
            };
        }
    }
}

fn normalize_number(kind: SourceKind, column: &str, value: Value, decimals: i32) -> Value {
    let number = match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.len() <= MAX_NUMERIC_TEXT_LEN => match s.trim().parse::<f64>() {
            Ok(parsed) => Some(parsed),
            Err(_) => return value,
        },
        _ => return value,
    };

    let Some(number) = number.filter(|n| n.is_finite()) else {
        return Value::Null;
    };

    if number.abs() > numeric_limit(kind) {
        warn!(
            "{} field '{}': value {} exceeds limits, setting to NULL",
            kind, column, number
        );
        return Value::Null;
    }

    let scale = 10f64.powi(decimals);
    Number::from_f64((number * scale).round() / scale).map_or(Value::Null, Value::Number)
}

fn normalize_datetime(value: Value) -> Value {
    let Value::String(text) = &value else {
        return value;
    };

    match parse_timestamp(text) {
        // Offsets are dropped; the wall-clock part is kept as written
        Some(parsed) => Value::String(parsed.format("%Y-%m-%d %H:%M:%S").to_string()),
        None => value,
    }
}

/// ISO-8601 timestamp with a `Z`, `+hh:mm`, `+hhmm` or no offset
fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if !text.contains('T') {
        return None;
    }

    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|parsed| parsed.naive_local())
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

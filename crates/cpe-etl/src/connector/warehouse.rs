//! Redshift connector over the PostgreSQL wire protocol

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Number, Value};
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column, ConnectOptions, Connection, PgConnection, Row, TypeInfo};
use tracing::{info, warn};

use super::normalize::normalize_output;
use super::SourceConnector;
use crate::error::{EtlError, Result};
use crate::model::{QueryOutput, QueryRef, SourceKind};
use crate::settings::WarehouseSettings;

/// Executes SQL against the warehouse, one connection per call
#[derive(Debug, Clone)]
pub struct WarehouseConnector {
    options: PgConnectOptions,
}

impl WarehouseConnector {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    pub fn from_settings(settings: &WarehouseSettings) -> Result<Self> {
        let require = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| EtlError::configuration(format!("{name} is not set")))
        };

        let options = PgConnectOptions::new()
            .host(&require(&settings.host, "REDSHIFT_HOST")?)
            .port(settings.port)
            .username(&require(&settings.user, "REDSHIFT_USER")?)
            .password(&require(&settings.password, "REDSHIFT_PASSWORD")?)
            .database(&require(&settings.database, "REDSHIFT_DATABASE")?)
            .disable_statement_logging();

        Ok(Self::new(options))
    }

    async fn run(conn: &mut PgConnection, sql: &str) -> Result<QueryOutput> {
        let rows: Vec<PgRow> = sqlx::query(sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(classify_error)?;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows = rows
            .iter()
            .map(|row| {
                (0..row.columns().len())
                    .map(|idx| decode_cell(row, idx))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(QueryOutput::new(columns, rows))
    }
}

#[async_trait]
impl SourceConnector for WarehouseConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::Warehouse
    }

    async fn execute(&self, query: &QueryRef) -> Result<QueryOutput> {
        let sql = query.load()?;

        let mut conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| EtlError::connection(format!("failed to connect to warehouse: {e}")))?;

        let result = Self::run(&mut conn, &sql).await;

        if let Err(e) = conn.close().await {
            warn!("Failed to close warehouse connection cleanly: {}", e);
        }

        let mut output = result?;
        normalize_output(SourceKind::Warehouse, &mut output);
        info!(
            "Warehouse query {} returned {} rows",
            query.display_name(),
            output.row_count()
        );
        Ok(output)
    }
}

/// Server-side rejections are query failures; everything else is connectivity
fn classify_error(err: sqlx::Error) -> EtlError {
    match err {
        sqlx::Error::Database(db) => EtlError::query(db.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            EtlError::query(err.to_string())
        },
        other => EtlError::connection(other.to_string()),
    }
}

fn decode_cell(row: &PgRow, idx: usize) -> Result<Value> {
    let column = row.columns()[idx].name();
    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();

    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Value::Bool)),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .map(|v| v.map(Value::from)),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .map(|v| v.map(Value::from)),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .map(|v| v.map(Value::from)),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .map(|v| v.and_then(|n| float_value(f64::from(n)))),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)
            .map(|v| v.and_then(float_value)),
        "NUMERIC" => row
            .try_get::<Option<BigDecimal>, _>(idx)
            .map(|v| v.and_then(|n| n.to_string().parse::<f64>().ok()).and_then(float_value)),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .map(|v| v.map(|d| Value::String(d.format("%Y-%m-%d").to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .map(|v| v.map(|d| Value::String(d.format("%Y-%m-%d %H:%M:%S").to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .map(|v| v.map(|d| Value::String(d.format("%Y-%m-%d %H:%M:%S").to_string()))),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(idx)
            .map(|v| v.filter(|json| !json.is_null())),
        _ => row.try_get::<Option<String>, _>(idx).map(|v| v.map(Value::String)),
    };

    cell_value(column, &type_name, decoded)
}

/// A cell that cannot be decoded fails the query rather than staging a null
fn cell_value(
    column: &str,
    type_name: &str,
    decoded: std::result::Result<Option<Value>, sqlx::Error>,
) -> Result<Value> {
    match decoded {
        Ok(value) => Ok(value.unwrap_or(Value::Null)),
        Err(e) => Err(EtlError::query(format!(
            "could not decode column {column} ({type_name}): {e}"
        ))),
    }
}

fn float_value(n: f64) -> Option<Value> {
    Number::from_f64(n).map(Value::Number)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_from_settings_requires_credentials() {
        let settings = WarehouseSettings {
            host: Some("warehouse.example.com".to_string()),
            port: 5439,
            user: None,
            password: Some("secret".to_string()),
            database: Some("dev".to_string()),
        };

        let err = WarehouseConnector::from_settings(&settings).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("REDSHIFT_USER"));
    }

    #[test]
    fn test_undecodable_cell_fails_the_query() {
        let err = cell_value(
            "amount",
            "NUMERIC",
            Err(sqlx::Error::Decode("invalid digit".into())),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Query);
        assert!(err.to_string().contains("amount"));
        assert_eq!(cell_value("amount", "NUMERIC", Ok(None)).unwrap(), Value::Null);
    }

    #[test]
    fn test_pool_errors_are_connection_failures() {
        assert_eq!(classify_error(sqlx::Error::PoolTimedOut).kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_missing_query_file_fails_before_connecting() {
        // Port 1 is never listening; the query file is checked first
        let options = PgConnectOptions::new().host("127.0.0.1").port(1);
        let connector = WarehouseConnector::new(options);

        let err = connector
            .execute(&QueryRef::new("/nonexistent/query.sql"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
    }

    #[tokio::test]
    #[ignore] // Requires a PostgreSQL-compatible warehouse at STAGING_DATABASE_URL
    async fn test_decodes_common_types() {
        let url = std::env::var("STAGING_DATABASE_URL").expect("STAGING_DATABASE_URL must be set");
        let options: PgConnectOptions = url.parse().unwrap();
        let connector = WarehouseConnector::new(options);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("types.sql");
        std::fs::write(
            &path,
            "SELECT 1::int4 AS id, 12.346::numeric AS amount, 'x'::text AS name, \
             DATE '2024-01-02' AS close_date, NULL::text AS missing",
        )
        .unwrap();

        let output = connector.execute(&QueryRef::new(&path)).await.unwrap();
        assert_eq!(output.columns, vec!["id", "amount", "name", "close_date", "missing"]);
        assert_eq!(
            output.rows[0],
            vec![
                Value::from(1),
                serde_json::json!(12.35),
                Value::String("x".to_string()),
                Value::String("2024-01-02".to_string()),
                Value::Null,
            ]
        );
    }
}

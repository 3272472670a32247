//! PostgreSQL staging store
//!
//! Each chunk of rows is shipped as one JSONB array and expanded
//! server-side with `jsonb_populate_recordset`, so a chunk costs a single
//! statement regardless of width. Chunks commit independently; a failure
//! reports how many rows earlier chunks already made visible.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Instant;
use tracing::{debug, info};

use super::{quote_identifier, quote_target, stamp_row, staged_columns, StagingStore};
use super::PROGRESS_INTERVAL_ROWS;
use crate::error::{EtlError, Result};
use crate::model::{BatchStamp, QueryOutput};
use crate::settings::StagingSettings;

/// Staging tables in a PostgreSQL database
#[derive(Debug, Clone)]
pub struct PgStagingStore {
    pool: PgPool,
    batch_size: usize,
}

impl PgStagingStore {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Open a pool from the staging settings
    pub async fn connect(settings: &StagingSettings, batch_size: usize) -> Result<Self> {
        let url = settings
            .database_url
            .as_deref()
            .ok_or_else(|| EtlError::configuration("STAGING_DATABASE_URL is not set"))?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(url)
            .await
            .map_err(|e| EtlError::connection(format!("failed to connect to staging database: {e}")))?;

        info!(
            "Connected to staging database (max {} connections)",
            settings.max_connections
        );

        Ok(Self::new(pool, batch_size))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn insert_sql(target: &str, columns: &[String]) -> Result<String> {
        let table = quote_target(target)?;
        let column_list = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!(
            "INSERT INTO {table} ({column_list}) \
             SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1)"
        ))
    }
}

#[async_trait]
impl StagingStore for PgStagingStore {
    async fn has_target(&self, target: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(target)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EtlError::connection(format!("failed to look up '{target}': {e}")))?;

        Ok(found.is_some())
    }

    async fn clear(&self, target: &str) -> Result<()> {
        let table = quote_target(target).map_err(|e| EtlError::clear(target, e.to_string()))?;

        sqlx::query(&format!("TRUNCATE TABLE {table}"))
            .execute(&self.pool)
            .await
            .map_err(|e| EtlError::clear(target, e.to_string()))?;

        debug!("Truncated {}", target);
        Ok(())
    }

    async fn bulk_load(
        &self,
        target: &str,
        output: &QueryOutput,
        stamp: &BatchStamp,
    ) -> Result<u64> {
        if output.is_empty() {
            return Ok(0);
        }

        let columns = staged_columns(output);
        let sql = Self::insert_sql(target, &columns)
            .map_err(|e| EtlError::load(target, Some(0), e.to_string()))?;

        let total = output.row_count();
        let started = Instant::now();
        let mut committed: u64 = 0;
        let mut next_progress = PROGRESS_INTERVAL_ROWS;

        for chunk in output.rows.chunks(self.batch_size) {
            let payload = Value::Array(
                chunk
                    .iter()
                    .map(|row| Value::Object(stamp_row(&output.columns, row, stamp)))
                    .collect(),
            );

            let result = sqlx::query(&sql)
                .bind(payload)
                .execute(&self.pool)
                .await
                .map_err(|e| EtlError::load(target, Some(committed), e.to_string()))?;

            committed += result.rows_affected();

            if committed >= next_progress {
                let elapsed = started.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 { committed as f64 / elapsed } else { 0.0 };
                info!(
                    "Inserted {}/{} rows into {} ({:.0} rows/sec)",
                    committed, total, target, rate
                );
                next_progress = (committed / PROGRESS_INTERVAL_ROWS + 1) * PROGRESS_INTERVAL_ROWS;
            }
        }

        info!(
            "Loaded {} rows into {} in {:.2}s",
            committed,
            target,
            started.elapsed().as_secs_f64()
        );

        Ok(committed)
    }
}

//! In-process staging store for dry runs and tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{stamp_row, StagingStore};
use crate::error::{EtlError, Result};
use crate::model::{BatchId, BatchStamp, QueryOutput};

/// A row as it sits in a staging table
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub batch_id: BatchId,
    pub extracted_at: DateTime<Utc>,
    /// Business columns plus the stamped audit columns
    pub values: Map<String, Value>,
}

/// One call made against the store, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    HasTarget(String),
    Clear(String),
    BulkLoad { target: String, rows: u64 },
}

#[derive(Debug, Clone, Copy)]
enum LoadFault {
    AfterRows(u64),
    UnknownCount,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, Vec<StagedRow>>,
    clear_faults: HashSet<String>,
    load_faults: HashMap<String, LoadFault>,
    journal: Vec<StoreCall>,
}

/// Staging tables held in memory
#[derive(Debug, Default)]
pub struct MemoryStagingStore {
    inner: Mutex<Inner>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with empty tables for each name
    pub fn with_targets<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for target in targets {
            store.add_target(target);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_target(&self, target: impl Into<String>) {
        self.lock().tables.entry(target.into()).or_default();
    }

    /// Put rows into a table directly, as a previous run would have left them
    pub fn seed(&self, target: &str, rows: Vec<StagedRow>) {
        self.lock()
            .tables
            .entry(target.to_string())
            .or_default()
            .extend(rows);
    }

    /// Make `clear(target)` fail
    pub fn fail_clear(&self, target: impl Into<String>) {
        self.lock().clear_faults.insert(target.into());
    }

    /// Make `bulk_load(target)` fail once `committed` rows are in
    pub fn fail_load_after(&self, target: impl Into<String>, committed: u64) {
        self.lock()
            .load_faults
            .insert(target.into(), LoadFault::AfterRows(committed));
    }

    /// Make `bulk_load(target)` fail without reporting a committed count
    pub fn fail_load_unknown(&self, target: impl Into<String>) {
        self.lock()
            .load_faults
            .insert(target.into(), LoadFault::UnknownCount);
    }

    pub fn rows(&self, target: &str) -> Vec<StagedRow> {
        self.lock().tables.get(target).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, target: &str) -> usize {
        self.lock().tables.get(target).map_or(0, Vec::len)
    }

    pub fn journal(&self) -> Vec<StoreCall> {
        self.lock().journal.clone()
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn has_target(&self, target: &str) -> Result<bool> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::HasTarget(target.to_string()));
        Ok(inner.tables.contains_key(target))
    }

    async fn clear(&self, target: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::Clear(target.to_string()));

        if inner.clear_faults.contains(target) {
            return Err(EtlError::clear(target, "injected clear failure"));
        }

        match inner.tables.get_mut(target) {
            Some(rows) => {
                rows.clear();
                Ok(())
            },
            None => Err(EtlError::clear(target, "table does not exist")),
        }
    }

    async fn bulk_load(
        &self,
        target: &str,
        output: &QueryOutput,
        stamp: &BatchStamp,
    ) -> Result<u64> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::BulkLoad {
            target: target.to_string(),
            rows: output.row_count(),
        });

        let fault = inner.load_faults.get(target).copied();
        let Some(table) = inner.tables.get_mut(target) else {
            return Err(EtlError::load(target, Some(0), "table does not exist"));
        };

        let limit = match fault {
            Some(LoadFault::AfterRows(n)) => n.min(output.row_count()) as usize,
            Some(LoadFault::UnknownCount) => {
                return Err(EtlError::load(target, None, "injected load failure"));
            },
            None => output.rows.len(),
        };

        for row in output.rows.iter().take(limit) {
            table.push(StagedRow {
                batch_id: stamp.batch_id.clone(),
                extracted_at: stamp.extracted_at,
                values: stamp_row(&output.columns, row, stamp),
            });
        }

        if fault.is_some() {
            return Err(EtlError::load(
                target,
                Some(limit as u64),
                "injected load failure",
            ));
        }

        Ok(limit as u64)
    }
}

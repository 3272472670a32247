//! Shared fixtures for ETL integration tests
//!
//! Every run here uses fake connectors, an in-memory staging store, an
//! in-memory SQLite ledger and a stepping clock, so runs are deterministic
//! and need no external systems.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use cpe_etl::clock::SteppingClock;
use cpe_etl::connector::{ConnectorSet, FakeConnector};
use cpe_etl::ledger::SqliteLedger;
use cpe_etl::model::{Job, QueryRef, SourceKind};
use cpe_etl::staging::MemoryStagingStore;
use cpe_etl::{JobRegistry, Orchestrator};
use std::sync::Arc;

/// 02:00 UTC, the nightly schedule
pub fn run_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap()
}

/// Warehouse job writing to `stg_<name>`
pub fn warehouse_job(name: &str) -> Job {
    Job::new(
        name,
        SourceKind::Warehouse,
        QueryRef::new(format!("queries/redshift/{name}.sql")),
        format!("stg_{name}"),
    )
}

/// CRM job writing to `stg_sf_<name>`
pub fn crm_job(name: &str) -> Job {
    Job::new(
        name,
        SourceKind::Crm,
        QueryRef::new(format!("queries/salesforce/{name}.soql")),
        format!("stg_sf_{name}"),
    )
}

pub fn registry(jobs: Vec<Job>) -> JobRegistry {
    JobRegistry::new(jobs).expect("valid registry")
}

/// Store with an empty table for every target in the registry
pub fn store_for(registry: &JobRegistry) -> Arc<MemoryStagingStore> {
    Arc::new(MemoryStagingStore::with_targets(registry.targets()))
}

/// Fakes and sinks for one test run
pub struct Harness {
    pub warehouse: FakeConnector,
    pub crm: FakeConnector,
    pub store: Arc<MemoryStagingStore>,
    pub ledger: Arc<SqliteLedger>,
}

impl Harness {
    pub fn new(store: Arc<MemoryStagingStore>) -> Self {
        Self {
            warehouse: FakeConnector::new(SourceKind::Warehouse),
            crm: FakeConnector::new(SourceKind::Crm),
            store,
            ledger: Arc::new(SqliteLedger::in_memory().expect("in-memory ledger")),
        }
    }

    pub fn for_registry(registry: &JobRegistry) -> Self {
        Self::new(store_for(registry))
    }

    /// Build the orchestrator, consuming the configured connectors
    pub fn orchestrator(self) -> (Orchestrator, Arc<MemoryStagingStore>, Arc<SqliteLedger>) {
        let connectors = ConnectorSet::new()
            .with(Arc::new(self.warehouse))
            .with(Arc::new(self.crm));
        let orchestrator = Orchestrator::new(connectors, self.store.clone(), self.ledger.clone())
            .with_clock(Arc::new(SteppingClock::new(run_start(), Duration::milliseconds(250))));
        (orchestrator, self.store, self.ledger)
    }
}

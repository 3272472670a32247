//! Run-level behaviour of the orchestrator
//!
//! These tests drive complete runs against fakes and check:
//! - Staging tables are truncated before they are loaded
//! - A failing job never stops its siblings
//! - Terminal status follows the job outcomes
//! - Every staged row carries the run's audit stamp
//! - Invalid configuration is rejected before any table is touched
//! - Ledger and lease behaviour at the edges of a run

mod common;

use async_trait::async_trait;
use common::{crm_job, registry, run_start, store_for, warehouse_job, Harness};
use cpe_etl::error::{ErrorKind, EtlError, Result};
use cpe_etl::lease::{FileRunLease, RunLease};
use cpe_etl::ledger::{ExecutionLedger, SqliteLedger};
use cpe_etl::model::{
    BatchId, Job, JobOutcome, JobResult, QueryRef, Run, RunPhase, RunStatus, RunSummary,
    SourceKind, BATCH_ID_COLUMN,
};
use cpe_etl::staging::{MemoryStagingStore, StagedRow, StagingStore, StoreCall};
use cpe_etl::{Orchestrator, RunOptions};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;

fn stale_row(batch: &str) -> StagedRow {
    let mut values = Map::new();
    values.insert("Id".to_string(), json!("left-over"));
    values.insert(BATCH_ID_COLUMN.to_string(), json!(batch));
    StagedRow {
        batch_id: BatchId::new(batch),
        extracted_at: run_start() - chrono::Duration::days(1),
        values,
    }
}

#[tokio::test]
async fn test_truncate_before_load_leaves_only_current_batch() {
    let registry = registry(vec![warehouse_job("commission_items"), crm_job("opportunities")]);
    let store = store_for(&registry);
    store.seed("stg_commission_items", vec![stale_row("20240229020000000"); 3]);
    store.seed("stg_sf_opportunities", vec![stale_row("20240229020000000")]);

    let (orchestrator, store, _) = Harness::new(store).orchestrator();
    let report = orchestrator.run(&registry).await;

    assert_eq!(report.status(), RunStatus::Succeeded);
    for target in ["stg_commission_items", "stg_sf_opportunities"] {
        let rows = store.rows(target);
        assert_eq!(rows.len(), 5, "mock rows only in {target}");
        assert!(rows.iter().all(|r| r.batch_id == report.run().batch_id));
    }
}

#[tokio::test]
async fn test_failing_job_is_isolated() {
    let jobs = vec![
        warehouse_job("commission_items"),
        warehouse_job("referral_payments"),
        crm_job("opportunities"),
        crm_job("accounts"),
    ];
    let registry = registry(jobs.clone());

    let mut harness = Harness::for_registry(&registry);
    harness.crm = harness
        .crm
        .with_connection_failure(&jobs[2].query_ref, "session expired");
    let (orchestrator, store, _) = harness.orchestrator();

    let report = orchestrator.run(&registry).await;

    assert_eq!(report.results().len(), 4);
    let failed: Vec<_> = report.summary.failed_jobs().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job_name, "opportunities");
    assert_eq!(failed[0].error_kind, Some(ErrorKind::Connection));
    assert_eq!(failed[0].rows_inserted, 0);

    // The job after the failure still ran
    assert_eq!(store.row_count("stg_sf_accounts"), 5);
    assert_eq!(report.status(), RunStatus::Partial);
    assert_eq!(report.phase, RunPhase::DonePartial);
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn test_all_jobs_failing_closes_run_as_failed() {
    let jobs = vec![warehouse_job("commission_items"), crm_job("opportunities")];
    let registry = registry(jobs.clone());

    let mut harness = Harness::for_registry(&registry);
    harness.warehouse = harness
        .warehouse
        .with_query_failure(&jobs[0].query_ref, "relation does not exist");
    harness.crm = harness
        .crm
        .with_query_failure(&jobs[1].query_ref, "MALFORMED_QUERY");
    let (orchestrator, _, ledger) = harness.orchestrator();

    let report = orchestrator.run(&registry).await;
    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    assert!(report.ledger_error.is_none());

    let recorded = ledger.latest_summary().await.unwrap().unwrap();
    assert_eq!(recorded.run.batch_id, report.run().batch_id);
    assert_eq!(recorded.run.status, RunStatus::Failed);
    assert!(recorded.run.ended_at.is_some());
    assert_eq!(recorded.results.len(), 2);
    let summary = recorded.run.error_summary.unwrap();
    assert!(summary.contains("commission_items"));
    assert!(summary.contains("opportunities"));
}

#[tokio::test]
async fn test_all_jobs_succeeding_sums_rows() {
    let jobs = vec![
        warehouse_job("commission_items"),
        warehouse_job("adjustments"),
        crm_job("opportunities"),
    ];
    let registry = registry(jobs.clone());

    let mut harness = Harness::for_registry(&registry);
    harness.warehouse = harness
        .warehouse
        .with_rows(&jobs[0].query_ref, 120)
        .with_rows(&jobs[1].query_ref, 0);
    harness.crm = harness.crm.with_rows(&jobs[2].query_ref, 33);
    let (orchestrator, store, _) = harness.orchestrator();

    let report = orchestrator.run(&registry).await;

    assert_eq!(report.status(), RunStatus::Succeeded);
    assert_eq!(report.phase, RunPhase::DoneSuccess);
    assert_eq!(report.summary.rows_queried_total(), 153);
    assert_eq!(report.summary.rows_inserted_total(), 153);
    assert_eq!(store.row_count("stg_commission_items"), 120);
    assert_eq!(store.row_count("stg_adjustments"), 0);
    assert_eq!(store.row_count("stg_sf_opportunities"), 33);
    assert!(report.run().error_summary.is_none());
}

#[tokio::test]
async fn test_clearing_empty_target_twice() {
    let store = MemoryStagingStore::with_targets(["stg_adjustments"]);

    store.clear("stg_adjustments").await.unwrap();
    store.clear("stg_adjustments").await.unwrap();

    assert_eq!(store.row_count("stg_adjustments"), 0);
}

#[tokio::test]
async fn test_rows_are_stamped_within_run_window() {
    let jobs = vec![warehouse_job("commission_items"), crm_job("opportunities")];
    let registry = registry(jobs);
    let (orchestrator, store, _) = Harness::for_registry(&registry).orchestrator();

    let report = orchestrator.run(&registry).await;
    let run = report.run();
    let ended_at = run.ended_at.unwrap();

    for target in registry.targets() {
        let rows = store.rows(target);
        assert!(!rows.is_empty());
        for row in rows {
            assert_eq!(row.batch_id, run.batch_id);
            assert!(row.extracted_at >= run.started_at);
            assert!(row.extracted_at <= ended_at);
            assert_eq!(row.values[BATCH_ID_COLUMN], json!(run.batch_id.as_str()));
        }
    }
}

#[tokio::test]
async fn test_unknown_target_fails_before_any_mutation() {
    let registry = registry(vec![
        warehouse_job("commission_items"),
        warehouse_job("retired_table"),
    ]);
    let store = Arc::new(MemoryStagingStore::with_targets(["stg_commission_items"]));
    store.seed("stg_commission_items", vec![stale_row("20240229020000000")]);

    let (orchestrator, store, ledger) = Harness::new(store).orchestrator();
    let report = orchestrator.run(&registry).await;

    assert_eq!(report.status(), RunStatus::Failed);
    assert!(report.results().is_empty());
    assert!(report
        .run()
        .error_summary
        .as_deref()
        .unwrap()
        .contains("stg_retired_table"));

    assert!(store
        .journal()
        .iter()
        .all(|call| matches!(call, StoreCall::HasTarget(_))));
    assert_eq!(store.row_count("stg_commission_items"), 1);

    // Still exactly one closed record
    let recorded = ledger.latest_summary().await.unwrap().unwrap();
    assert_eq!(recorded.run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_clear_failure_aborts_before_loading() {
    let registry = registry(vec![warehouse_job("commission_items"), crm_job("opportunities")]);
    let store = store_for(&registry);
    store.fail_clear("stg_sf_opportunities");

    let (orchestrator, store, _) = Harness::new(store).orchestrator();
    let report = orchestrator.run(&registry).await;

    assert_eq!(report.status(), RunStatus::Failed);
    assert!(report.results().is_empty());
    assert!(report.run().error_summary.as_deref().unwrap().contains("Clear failure"));
    assert!(!store
        .journal()
        .iter()
        .any(|call| matches!(call, StoreCall::BulkLoad { .. })));
}

#[tokio::test]
async fn test_nightly_scenario_with_partial_load() {
    let jobs = vec![
        warehouse_job("commission_items"),
        warehouse_job("referral_payments"),
        warehouse_job("adjustments"),
    ];
    let registry = registry(jobs.clone());

    let mut harness = Harness::for_registry(&registry);
    harness.warehouse = harness
        .warehouse
        .with_rows(&jobs[0].query_ref, 1000)
        .with_rows(&jobs[1].query_ref, 200)
        .with_rows(&jobs[2].query_ref, 0);
    harness.store.fail_load_after("stg_referral_payments", 50);
    let (orchestrator, store, _) = harness.orchestrator();

    let report = orchestrator.run(&registry).await;

    let summary: Vec<_> = report
        .results()
        .iter()
        .map(|r| (r.job_name.as_str(), r.outcome, r.rows_queried, r.rows_inserted))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("commission_items", JobOutcome::Succeeded, 1000, 1000),
            ("referral_payments", JobOutcome::Failed, 200, 50),
            ("adjustments", JobOutcome::Succeeded, 0, 0),
        ]
    );
    assert_eq!(report.results()[1].error_kind, Some(ErrorKind::Load));
    assert_eq!(report.status(), RunStatus::Partial);

    let journal = store.journal();
    let last_clear = journal
        .iter()
        .rposition(|call| matches!(call, StoreCall::Clear(_)))
        .unwrap();
    let first_load = journal
        .iter()
        .position(|call| matches!(call, StoreCall::BulkLoad { .. }))
        .unwrap();
    assert!(last_clear < first_load);
    for job in &jobs {
        assert!(journal.contains(&StoreCall::Clear(job.target.clone())));
    }
}

#[tokio::test]
async fn test_unknown_committed_count_is_recorded_as_zero() {
    let registry = registry(vec![warehouse_job("commission_items")]);
    let harness = Harness::for_registry(&registry);
    harness.store.fail_load_unknown("stg_commission_items");
    let (orchestrator, _, _) = harness.orchestrator();

    let report = orchestrator.run(&registry).await;
    let result = &report.results()[0];

    assert_eq!(result.rows_queried, 5);
    assert_eq!(result.rows_inserted, 0);
    assert!(result
        .error_detail
        .as_deref()
        .unwrap()
        .contains("committed row count unknown"));
}

#[tokio::test]
async fn test_parallel_jobs_keep_registry_order() {
    let shared = |name: &str| {
        Job::new(
            name,
            SourceKind::Warehouse,
            QueryRef::new(format!("{name}.sql")),
            "stg_payments",
        )
    };
    let jobs = vec![
        shared("direct_payments"),
        warehouse_job("commission_items"),
        shared("referral_payments"),
        crm_job("opportunities"),
    ];
    let registry = registry(jobs.clone());

    let mut harness = Harness::for_registry(&registry);
    harness.warehouse = harness
        .warehouse
        .with_rows(&jobs[0].query_ref, 3)
        .with_rows(&jobs[1].query_ref, 4)
        .with_rows(&jobs[2].query_ref, 7)
        .with_delay(Duration::from_millis(20));
    let (orchestrator, store, _) = harness.orchestrator();
    let orchestrator = orchestrator.with_options(RunOptions {
        connector_timeout: Duration::from_secs(5),
        max_parallel_jobs: 4,
    });

    let report = orchestrator.run(&registry).await;

    let names: Vec<_> = report.results().iter().map(|r| r.job_name.as_str()).collect();
    assert_eq!(
        names,
        vec!["direct_payments", "commission_items", "referral_payments", "opportunities"]
    );
    assert_eq!(report.status(), RunStatus::Succeeded);
    assert_eq!(store.row_count("stg_payments"), 10);

    // The shared target is cleared once
    let clears = store
        .journal()
        .iter()
        .filter(|call| **call == StoreCall::Clear("stg_payments".to_string()))
        .count();
    assert_eq!(clears, 1);
}

struct UnwritableLedger;

#[async_trait]
impl ExecutionLedger for UnwritableLedger {
    async fn record(&self, _run: &Run, _results: &[JobResult]) -> Result<()> {
        Err(EtlError::ledger_write("disk full"))
    }

    async fn latest_summary(&self) -> Result<Option<RunSummary>> {
        Ok(None)
    }

    async fn summary(&self, _batch_id: &BatchId) -> Result<Option<RunSummary>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_ledger_failure_does_not_change_status() {
    let registry = registry(vec![warehouse_job("commission_items")]);
    let harness = Harness::for_registry(&registry);
    let connectors = cpe_etl::connector::ConnectorSet::new().with(Arc::new(harness.warehouse));
    let orchestrator =
        Orchestrator::new(connectors, harness.store.clone(), Arc::new(UnwritableLedger));

    let report = orchestrator.run(&registry).await;

    assert_eq!(report.status(), RunStatus::Succeeded);
    assert_eq!(report.exit_code(), 0);
    assert!(report.ledger_error.as_deref().unwrap().contains("disk full"));
}

#[tokio::test]
async fn test_file_lease_held_by_other_run() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = dir.path().join("etl.lock");
    let other = FileRunLease::new(&lock_path, Duration::from_secs(3600));
    other.acquire(&BatchId::new("20240301015959000")).await.unwrap();

    let registry = registry(vec![warehouse_job("commission_items")]);
    let (orchestrator, store, ledger) = Harness::for_registry(&registry).orchestrator();
    let orchestrator = orchestrator.with_lease(Arc::new(FileRunLease::new(
        &lock_path,
        Duration::from_secs(3600),
    )));

    let report = orchestrator.run(&registry).await;

    assert_eq!(report.status(), RunStatus::Failed);
    assert!(store.journal().is_empty());
    assert!(lock_path.exists(), "foreign lock must survive");
    assert!(ledger
        .summary(&report.run().batch_id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_ledger_refuses_to_rewrite_a_batch() {
    let registry = registry(vec![warehouse_job("commission_items")]);
    let store = store_for(&registry);
    let ledger = Arc::new(SqliteLedger::in_memory().unwrap());

    let mut reports = Vec::new();
    for _ in 0..2 {
        let mut harness = Harness::new(store.clone());
        harness.ledger = ledger.clone();
        let (orchestrator, _, _) = harness.orchestrator();
        reports.push(orchestrator.run(&registry).await);
    }

    // Both harness clocks start at the same instant, so both runs get the
    // same batch ID
    assert_eq!(reports[0].run().batch_id, reports[1].run().batch_id);
    assert!(reports[0].ledger_error.is_none());
    assert!(reports[1].ledger_error.is_some());
    assert_eq!(reports[1].status(), RunStatus::Succeeded);

    let recorded = ledger
        .summary(&reports[0].run().batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recorded.results.len(), 1);
}

#[tokio::test]
async fn test_run_from_job_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.yml");
    std::fs::write(
        &config,
        r#"
redshift:
  queries:
    - name: commission_items
      file: queries/redshift/commission_items.sql
      target: stg_commission_items_v2
salesforce:
  queries:
    - name: opportunities
      file: queries/salesforce/opportunities.soql
"#,
    )
    .unwrap();

    let items = QueryRef::new(dir.path().join("queries/redshift/commission_items.sql"));
    let store = Arc::new(MemoryStagingStore::with_targets([
        "stg_commission_items_v2",
        "stg_sf_opportunities",
    ]));
    let mut harness = Harness::new(store);
    harness.warehouse = harness.warehouse.with_rows(&items, 42);
    let (orchestrator, store, _) = harness.orchestrator();

    let report = orchestrator.run_config(&config).await;

    assert_eq!(report.status(), RunStatus::Succeeded);
    let targets: Vec<_> = report.results().iter().map(|r| r.target.as_str()).collect();
    assert_eq!(targets, vec!["stg_commission_items_v2", "stg_sf_opportunities"]);
    assert_eq!(store.row_count("stg_commission_items_v2"), 42);
    assert_eq!(store.row_count("stg_sf_opportunities"), 5);
}

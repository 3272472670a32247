//! Run orchestrator
//!
//! Drives one run through `INIT -> CLEARING -> EXTRACTING_LOADING ->
//! FINALIZING` and closes it exactly once:
//!
//! - INIT takes the run lease, loads the job registry and checks every
//!   target against the staging store. Any failure here ends the run before
//!   a table is touched.
//! - CLEARING truncates every distinct target. One failure ends the run.
//! - EXTRACTING_LOADING runs each job. A job failure becomes a failed
//!   [`JobResult`] and the loop moves on.
//! - FINALIZING closes the run, writes the ledger, releases the lease and
//!   hands the summary to the notification gateway.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::connector::ConnectorSet;
use crate::error::{EtlError, Result};
use crate::lease::{InProcessRunLease, RunLease};
use crate::ledger::ExecutionLedger;
use crate::model::{BatchId, BatchStamp, Job, JobResult, Run, RunPhase, RunStatus, RunSummary};
use crate::notify::{LogNotifier, NotificationGateway};
use crate::registry::{JobRegistry, JobsFile};
use crate::settings::{RunSettings, DEFAULT_CONNECTOR_TIMEOUT_SECS, DEFAULT_MAX_PARALLEL_JOBS};
use crate::staging::StagingStore;

/// Knobs for a single run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Upper bound on one connector call
    pub connector_timeout: Duration,
    /// Jobs executed at once; 1 runs them strictly in registry order
    pub max_parallel_jobs: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            connector_timeout: Duration::from_secs(DEFAULT_CONNECTOR_TIMEOUT_SECS),
            max_parallel_jobs: DEFAULT_MAX_PARALLEL_JOBS,
        }
    }
}

impl From<&RunSettings> for RunOptions {
    fn from(settings: &RunSettings) -> Self {
        Self {
            connector_timeout: settings.connector_timeout(),
            max_parallel_jobs: settings.max_parallel_jobs,
        }
    }
}

/// Closed run plus what happened after it was closed
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub phase: RunPhase,
    /// Set when the ledger could not record the run
    pub ledger_error: Option<String>,
    /// Set when the notification gateway could not deliver
    pub notification_error: Option<String>,
}

impl RunReport {
    pub fn run(&self) -> &Run {
        &self.summary.run
    }

    pub fn results(&self) -> &[JobResult] {
        &self.summary.results
    }

    pub fn status(&self) -> RunStatus {
        self.summary.run.status
    }

    /// Process exit code: 0 success, 2 partial, 1 failed
    pub fn exit_code(&self) -> i32 {
        match self.status() {
            RunStatus::Succeeded => 0,
            RunStatus::Partial => 2,
            RunStatus::Failed | RunStatus::Running => 1,
        }
    }
}

/// Runs the configured jobs against the staging store
pub struct Orchestrator {
    connectors: ConnectorSet,
    store: Arc<dyn StagingStore>,
    ledger: Arc<dyn ExecutionLedger>,
    notifier: Arc<dyn NotificationGateway>,
    lease: Arc<dyn RunLease>,
    clock: Arc<dyn Clock>,
    options: RunOptions,
}

impl Orchestrator {
    /// Create an orchestrator with log notifications, an in-process lease
    /// and the system clock
    pub fn new(
        connectors: ConnectorSet,
        store: Arc<dyn StagingStore>,
        ledger: Arc<dyn ExecutionLedger>,
    ) -> Self {
        Self {
            connectors,
            store,
            ledger,
            notifier: Arc::new(LogNotifier),
            lease: Arc::new(InProcessRunLease::new()),
            clock: Arc::new(SystemClock),
            options: RunOptions::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationGateway>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_lease(mut self, lease: Arc<dyn RunLease>) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Run an already built registry
    pub async fn run(&self, registry: &JobRegistry) -> RunReport {
        let registry = registry.clone();
        self.execute(move || Ok(registry)).await
    }

    /// Run the jobs declared in a `config.yml`
    ///
    /// A file that cannot be read or parsed fails the run at INIT, so it is
    /// still recorded in the ledger.
    pub async fn run_config(&self, path: &Path) -> RunReport {
        self.execute(|| {
            let file = JobsFile::load(path)?;
            JobRegistry::from_config(&file)
        })
        .await
    }

    async fn execute<F>(&self, load: F) -> RunReport
    where
        F: FnOnce() -> Result<JobRegistry> + Send,
    {
        let run = Run::start(self.clock.now());
        let span = info_span!("etl_run", batch_id = %run.batch_id);

        async move {
            info!("Starting ETL run with batch ID: {}", run.batch_id);
            enter(RunPhase::Init);

            let mut lease_held = false;
            let (results, fatal) = match self.prepare(&run.batch_id, load, &mut lease_held).await
            {
                Ok(registry) => (self.extract_and_load(&registry, &run.batch_id).await, None),
                Err(e) => {
                    error!(error = %e, "ETL run aborted before extraction");
                    (Vec::new(), Some(e))
                },
            };

            self.finalize(run, results, fatal, lease_held).await
        }
        .instrument(span)
        .await
    }

    /// INIT and CLEARING
    async fn prepare<F>(
        &self,
        batch_id: &BatchId,
        load: F,
        lease_held: &mut bool,
    ) -> Result<JobRegistry>
    where
        F: FnOnce() -> Result<JobRegistry> + Send,
    {
        self.lease.acquire(batch_id).await?;
        *lease_held = true;

        let registry = load()?;
        for job in registry.list() {
            if !self.connectors.contains(job.source_kind) {
                return Err(EtlError::configuration(format!(
                    "job '{}' needs a {} connector, none configured",
                    job.name, job.source_kind
                )));
            }
        }
        registry.validate(self.store.as_ref()).await?;

        enter(RunPhase::Clearing);
        let targets = registry.targets();
        for target in &targets {
            self.store.clear(target).await?;
            debug!("Cleared staging table {}", target);
        }
        info!("Cleared {} staging tables", targets.len());

        Ok(registry)
    }

    /// EXTRACTING_LOADING
    ///
    /// Results come back in registry order whatever the completion order.
    async fn extract_and_load(&self, registry: &JobRegistry, batch_id: &BatchId) -> Vec<JobResult> {
        enter(RunPhase::ExtractingLoading);

        let target_locks: HashMap<&str, Arc<Mutex<()>>> = registry
            .targets()
            .into_iter()
            .map(|t| (t, Arc::new(Mutex::new(()))))
            .collect();
        let total = registry.len();
        let parallel = self.options.max_parallel_jobs.max(1);

        let mut results: Vec<(usize, JobResult)> = stream::iter(registry.list().iter().enumerate())
            .map(|(index, job)| {
                let lock = target_locks.get(job.target.as_str()).cloned();
                async move {
                    info!("Processing job {} / {}: {}", index + 1, total, job.name);
                    let result = self.run_job(job, batch_id, lock).await;
                    (index, result)
                }
            })
            .buffer_unordered(parallel)
            .collect()
            .await;

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    async fn run_job(
        &self,
        job: &Job,
        batch_id: &BatchId,
        target_lock: Option<Arc<Mutex<()>>>,
    ) -> JobResult {
        let span = info_span!("job", job = %job.name, target = %job.target);
        let started_at = self.clock.now();

        async move {
            let output = match self.extract(job).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(error = %e, "✗ Extraction failed (continuing with next job)");
                    return JobResult::failed(job, batch_id, 0, &e, started_at, self.clock.now());
                },
            };
            let rows_queried = output.row_count();

            let stamp = BatchStamp::new(batch_id.clone(), self.clock.now());
            let _guard = match &target_lock {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };

            match self.store.bulk_load(&job.target, &output, &stamp).await {
                Ok(rows_inserted) => {
                    if rows_inserted > rows_queried {
                        warn!(
                            rows_queried,
                            rows_inserted,
                            "Staging store reported more rows inserted than queried"
                        );
                    }
                    info!(rows_queried, rows_inserted, "✓ Job completed");
                    JobResult::succeeded(
                        job,
                        batch_id,
                        rows_queried,
                        rows_inserted,
                        started_at,
                        self.clock.now(),
                    )
                },
                Err(e) => {
                    warn!(
                        rows_queried,
                        rows_inserted = e.committed_rows(),
                        error = %e,
                        "✗ Load failed (continuing with next job)"
                    );
                    JobResult::failed(job, batch_id, rows_queried, &e, started_at, self.clock.now())
                },
            }
        }
        .instrument(span)
        .await
    }

    /// One bounded connector call
    async fn extract(&self, job: &Job) -> Result<crate::model::QueryOutput> {
        let connector = self.connectors.get(job.source_kind)?;
        let timeout = self.options.connector_timeout;

        match tokio::time::timeout(timeout, connector.execute(&job.query_ref)).await {
            Ok(result) => result,
            Err(_) => Err(EtlError::connection(format!(
                "{} query '{}' timed out after {}s",
                job.source_kind,
                job.query_ref.display_name(),
                timeout.as_secs()
            ))),
        }
    }

    /// FINALIZING
    async fn finalize(
        &self,
        mut run: Run,
        results: Vec<JobResult>,
        fatal: Option<EtlError>,
        lease_held: bool,
    ) -> RunReport {
        enter(RunPhase::Finalizing);

        let ended_at = self.clock.now().max(run.started_at);
        run.close(ended_at, &results, fatal.as_ref());

        let ledger_error = match self.ledger.record(&run, &results).await {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "Failed to record run in ledger; audit trail is incomplete");
                Some(e.to_string())
            },
        };

        if lease_held {
            if let Err(e) = self.lease.release(&run.batch_id).await {
                warn!(error = %e, "Failed to release run lease");
            }
        }

        let summary = RunSummary::new(run, results);
        let notification_error = match self.notifier.deliver(&summary).await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "Failed to deliver run notification");
                Some(e.to_string())
            },
        };

        let phase = RunPhase::terminal_for(summary.run.status);
        info!(
            status = %summary.run.status,
            rows_queried = summary.rows_queried_total(),
            rows_inserted = summary.rows_inserted_total(),
            failed_jobs = summary.failed_jobs().count(),
            "ETL run completed ({})",
            phase
        );

        RunReport {
            summary,
            phase,
            ledger_error,
            notification_error,
        }
    }
}

fn enter(phase: RunPhase) {
    debug!(phase = %phase, "Entering phase");
}

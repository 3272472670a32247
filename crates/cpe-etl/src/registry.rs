//! Job registry
//!
//! Jobs are declared in `config.yml`, grouped by source:
//!
//! ```yaml
//! redshift:
//!   queries:
//!     - name: commission_items
//!       file: queries/redshift/commission_items.sql
//! salesforce:
//!   queries:
//!     - name: opportunities
//!       file: queries/salesforce/opportunities.soql
//!       target: stg_sf_opps
//! ```
//!
//! The registry flattens this into an ordered, immutable list: warehouse
//! jobs first, then CRM jobs, each in file order.

use cpe_common::CommonError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{EtlError, Result};
use crate::model::{Job, QueryRef, SourceKind};
use crate::staging::{validate_identifier, StagingStore};

/// Parsed `config.yml`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redshift: Option<SourceSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salesforce: Option<SourceSection>,
}

/// Queries configured for one source
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceSection {
    #[serde(default)]
    pub queries: Vec<QueryEntry>,
}

/// A single `{name, file, target?}` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryEntry {
    pub name: String,
    pub file: PathBuf,

    /// Staging table; defaults to the source's naming rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl JobsFile {
    /// Load the job file, resolving relative query paths against its directory
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EtlError::configuration(format!("failed to read '{}': {e}", path.display()))
        })?;

        let mut file = Self::from_yaml(&content)?;
        if let Some(base) = path.parent() {
            file.resolve_paths(base);
        }

        Ok(file)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file = serde_yaml::from_str(content).map_err(CommonError::from)?;
        Ok(file)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for section in [self.redshift.as_mut(), self.salesforce.as_mut()]
            .into_iter()
            .flatten()
        {
            for entry in &mut section.queries {
                if entry.file.is_relative() {
                    entry.file = base.join(&entry.file);
                }
            }
        }
    }

    fn sections(&self) -> impl Iterator<Item = (SourceKind, &QueryEntry)> {
        let warehouse = self
            .redshift
            .iter()
            .flat_map(|s| s.queries.iter().map(|q| (SourceKind::Warehouse, q)));
        let crm = self
            .salesforce
            .iter()
            .flat_map(|s| s.queries.iter().map(|q| (SourceKind::Crm, q)));
        warehouse.chain(crm)
    }
}

/// Ordered, validated set of jobs for one run
#[derive(Debug, Clone, PartialEq)]
pub struct JobRegistry {
    jobs: Vec<Job>,
}

impl JobRegistry {
    /// Build a registry from an already ordered job list
    pub fn new(jobs: Vec<Job>) -> Result<Self> {
        check_jobs(&jobs)?;
        Ok(Self { jobs })
    }

    pub fn from_config(config: &JobsFile) -> Result<Self> {
        let jobs = config
            .sections()
            .map(|(kind, entry)| {
                let target = entry
                    .target
                    .clone()
                    .unwrap_or_else(|| format!("{}{}", kind.default_target_prefix(), entry.name));
                Job::new(&entry.name, kind, QueryRef::new(&entry.file), target)
            })
            .collect();

        Self::new(jobs)
    }

    pub fn list(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Distinct targets in first-reference order
    pub fn targets(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.jobs
            .iter()
            .map(|j| j.target.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    /// Check every target against the staging store
    ///
    /// Must run before anything is cleared.
    pub async fn validate(&self, store: &dyn StagingStore) -> Result<()> {
        let mut unknown = BTreeSet::new();
        for target in self.targets() {
            if !store.has_target(target).await? {
                unknown.insert(target);
            }
        }

        if !unknown.is_empty() {
            let names: Vec<&str> = unknown.into_iter().collect();
            return Err(EtlError::configuration(format!(
                "unknown staging target(s): {}",
                names.join(", ")
            )));
        }

        info!(
            jobs = self.jobs.len(),
            targets = self.targets().len(),
            "Job registry validated"
        );
        Ok(())
    }
}

fn check_jobs(jobs: &[Job]) -> Result<()> {
    if jobs.is_empty() {
        return Err(EtlError::configuration("no jobs configured"));
    }

    let mut names = HashSet::new();
    for job in jobs {
        if job.name.trim().is_empty() {
            return Err(EtlError::configuration("job name must not be empty"));
        }
        if !names.insert(job.name.as_str()) {
            return Err(EtlError::configuration(format!(
                "duplicate job name '{}'",
                job.name
            )));
        }
        if job.query_ref.is_empty() {
            return Err(EtlError::configuration(format!(
                "job '{}' has no query file",
                job.name
            )));
        }
        validate_identifier(&job.target).map_err(|e| {
            EtlError::configuration(format!("job '{}': {e}", job.name))
        })?;
        debug!(job = %job.name, source = %job.source_kind, target = %job.target, "Registered job");
    }

    Ok(())
}

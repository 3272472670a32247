//! Run lease
//!
//! At most one run may hold the staging store at a time. The lease is taken
//! before the job registry is validated and released once the run is
//! closed, on every path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{EtlError, Result};
use crate::model::BatchId;

/// Exclusive claim on the staging store
#[async_trait]
pub trait RunLease: Send + Sync {
    async fn acquire(&self, batch_id: &BatchId) -> Result<()>;

    /// Give the lease back; releasing a lease held by another run is a no-op
    async fn release(&self, batch_id: &BatchId) -> Result<()>;
}

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub batch_id: BatchId,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Lease backed by an exclusively created lock file
///
/// A lock older than `stale_after` is assumed to belong to a crashed run
/// and is taken over. Only the holder of the sibling takeover file may
/// replace a stale lock, so two runs never both take it over.
#[derive(Debug, Clone)]
pub struct FileRunLease {
    path: PathBuf,
    stale_after: Duration,
}

/// Takeover file, removed when dropped
struct TakeoverGuard {
    path: PathBuf,
}

impl Drop for TakeoverGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove takeover file {}: {}", self.path.display(), e);
        }
    }
}

impl FileRunLease {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn takeover_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".takeover");
        PathBuf::from(name)
    }

    fn create_exclusive(path: &Path, body: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(body)?;
        file.sync_all()
    }

    fn try_create(&self, info: &LockInfo) -> Result<bool> {
        let body = serde_json::to_vec_pretty(info)
            .map_err(|e| EtlError::lease_unavailable(format!("failed to encode lock: {e}")))?;

        match Self::create_exclusive(&self.path, &body) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(EtlError::lease_unavailable(format!(
                "failed to create lock file '{}': {e}",
                self.path.display()
            ))),
        }
    }

    fn read_holder(&self) -> Option<LockInfo> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Age of the current lock, from its contents or else its mtime
    fn lock_age(&self, holder: Option<&LockInfo>) -> Option<Duration> {
        if let Some(holder) = holder {
            return (Utc::now() - holder.acquired_at).to_std().ok();
        }
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
    }

    fn is_stale(&self, holder: Option<&LockInfo>) -> bool {
        self.lock_age(holder)
            .is_some_and(|age| age > self.stale_after)
    }

    fn acquire_blocking(&self, batch_id: &BatchId) -> Result<()> {
        let info = LockInfo {
            batch_id: batch_id.clone(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        if self.try_create(&info)? {
            debug!("Acquired run lease {}", self.path.display());
            return Ok(());
        }

        let observed = self.read_holder();
        let describe = describe_holder(observed.as_ref());
        if !self.is_stale(observed.as_ref()) {
            return Err(EtlError::lease_unavailable(format!(
                "staging is locked by {describe}"
            )));
        }

        let _guard = self.claim_takeover()?;

        // The lock may have changed hands since it was first read
        let current = self.read_holder();
        if current != observed || !self.is_stale(current.as_ref()) {
            return Err(EtlError::lease_unavailable(format!(
                "staging is locked by {}",
                describe_holder(current.as_ref())
            )));
        }

        warn!("Taking over stale run lease held by {}", describe);
        match std::fs::remove_file(&self.path) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => {
                return Err(EtlError::lease_unavailable(format!(
                    "failed to remove stale lock: {e}"
                )));
            },
        }

        if self.try_create(&info)? {
            debug!("Acquired run lease {}", self.path.display());
            Ok(())
        } else {
            Err(EtlError::lease_unavailable(format!(
                "staging is locked by {}",
                describe_holder(self.read_holder().as_ref())
            )))
        }
    }

    fn claim_takeover(&self) -> Result<TakeoverGuard> {
        let path = self.takeover_path();
        match Self::create_exclusive(&path, std::process::id().to_string().as_bytes()) {
            Ok(()) => Ok(TakeoverGuard { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(EtlError::lease_unavailable(format!(
                    "another run is taking over the stale lease (remove '{}' if no run is active)",
                    path.display()
                )))
            },
            Err(e) => Err(EtlError::lease_unavailable(format!(
                "failed to create takeover file '{}': {e}",
                path.display()
            ))),
        }
    }

    fn release_blocking(&self, batch_id: &BatchId) -> Result<()> {
        match self.read_holder() {
            Some(holder) if &holder.batch_id == batch_id => {
                std::fs::remove_file(&self.path).map_err(|e| {
                    EtlError::lease_unavailable(format!("failed to remove lock file: {e}"))
                })?;
                debug!("Released run lease {}", self.path.display());
            },
            Some(holder) => warn!(
                "Run lease now belongs to batch {}, leaving it in place",
                holder.batch_id
            ),
            None => warn!("Run lease {} was already gone", self.path.display()),
        }
        Ok(())
    }
}

fn describe_holder(holder: Option<&LockInfo>) -> String {
    holder.map_or_else(
        || "an unknown run".to_string(),
        |h| format!("batch {} (pid {}) since {}", h.batch_id, h.pid, h.acquired_at),
    )
}

// Lock file IO is a handful of small syscalls, kept off the async workers
#[async_trait]
impl RunLease for FileRunLease {
    async fn acquire(&self, batch_id: &BatchId) -> Result<()> {
        let lease = self.clone();
        let batch_id = batch_id.clone();
        tokio::task::spawn_blocking(move || lease.acquire_blocking(&batch_id))
            .await
            .map_err(|e| EtlError::lease_unavailable(format!("lease task failed: {e}")))?
    }

    async fn release(&self, batch_id: &BatchId) -> Result<()> {
        let lease = self.clone();
        let batch_id = batch_id.clone();
        tokio::task::spawn_blocking(move || lease.release_blocking(&batch_id))
            .await
            .map_err(|e| EtlError::lease_unavailable(format!("lease task failed: {e}")))?
    }
}

/// Lease held in memory, for tests and dry runs
#[derive(Debug, Default)]
pub struct InProcessRunLease {
    holder: Mutex<Option<BatchId>>,
}

impl InProcessRunLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<BatchId> {
        self.holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl RunLease for InProcessRunLease {
    async fn acquire(&self, batch_id: &BatchId) -> Result<()> {
        let mut holder = self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match holder.as_ref() {
            Some(current) => Err(EtlError::lease_unavailable(format!(
                "staging is locked by batch {current}"
            ))),
            None => {
                *holder = Some(batch_id.clone());
                Ok(())
            },
        }
    }

    async fn release(&self, batch_id: &BatchId) -> Result<()> {
        let mut holder = self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if holder.as_ref() == Some(batch_id) {
            *holder = None;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_file_lease_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lease = FileRunLease::new(dir.path().join("etl.lock"), Duration::from_secs(3600));
        let first = BatchId::new("20240101000000000");
        let second = BatchId::new("20240101000001000");

        lease.acquire(&first).await.unwrap();
        let err = lease.acquire(&second).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseUnavailable);
        assert!(err.to_string().contains("20240101000000000"));

        lease.release(&first).await.unwrap();
        assert!(!lease.path().exists());
        lease.acquire(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etl.lock");
        let stale = LockInfo {
            batch_id: BatchId::new("20200101000000000"),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(7),
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lease = FileRunLease::new(&path, Duration::from_secs(6 * 3600));
        let batch = BatchId::new("20240101000000000");
        lease.acquire(&batch).await.unwrap();

        let holder: LockInfo =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(holder.batch_id, batch);
        assert!(!lease.takeover_path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_takeovers_of_stale_lock_admit_one_run() {
        for round in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("etl.lock");
            let stale = LockInfo {
                batch_id: BatchId::new("20200101000000000"),
                pid: 1,
                acquired_at: Utc::now() - chrono::Duration::hours(7),
            };
            std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

            let contenders: Vec<_> = (0..6)
                .map(|n| {
                    let lease = FileRunLease::new(&path, Duration::from_secs(6 * 3600));
                    tokio::spawn(async move {
                        let batch = BatchId::new(format!("2024010100000{round:02}{n}"));
                        lease.acquire(&batch).await.map(|()| batch)
                    })
                })
                .collect();

            let mut winners = Vec::new();
            for contender in contenders {
                match contender.await.unwrap() {
                    Ok(batch) => winners.push(batch),
                    Err(e) => assert_eq!(e.kind(), ErrorKind::LeaseUnavailable),
                }
            }

            assert_eq!(winners.len(), 1, "round {round}: {winners:?}");
            let holder: LockInfo =
                serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
            assert_eq!(holder.batch_id, winners[0]);
        }
    }

    #[tokio::test]
    async fn test_takeover_in_progress_blocks_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let lease = FileRunLease::new(dir.path().join("etl.lock"), Duration::from_secs(3600));
        let stale = LockInfo {
            batch_id: BatchId::new("20200101000000000"),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::write(lease.path(), serde_json::to_string(&stale).unwrap()).unwrap();
        std::fs::write(lease.takeover_path(), "1").unwrap();

        let err = lease
            .acquire(&BatchId::new("20240101000000000"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseUnavailable);
        assert!(err.to_string().contains("taking over"));

        // Another run's takeover file and the lock it guards are untouched
        assert!(lease.takeover_path().exists());
        let holder: LockInfo =
            serde_json::from_str(&std::fs::read_to_string(lease.path()).unwrap()).unwrap();
        assert_eq!(holder, stale);
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let lease = FileRunLease::new(dir.path().join("etl.lock"), Duration::from_secs(3600));
        let owner = BatchId::new("1");

        lease.acquire(&owner).await.unwrap();
        lease.release(&BatchId::new("2")).await.unwrap();
        assert!(lease.path().exists());
    }

    #[tokio::test]
    async fn test_in_process_lease() {
        let lease = InProcessRunLease::new();
        let batch = BatchId::new("1");

        lease.acquire(&batch).await.unwrap();
        assert!(lease.acquire(&BatchId::new("2")).await.is_err());
        lease.release(&batch).await.unwrap();
        assert!(lease.holder().is_none());
    }
}

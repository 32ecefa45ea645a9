// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable job store backed by one JSON snapshot per owner.
//!
//! ```text
//! <state_dir>/
//!   <sha256(owner)>.json   partition image: next_id + records
//!   <sha256(owner)>.lock   fs2 lock held while the image is replaced
//! ```
//!
//! The in-memory store stays authoritative for reads. Every create, delete
//! and status change writes the owner's next image first and is committed
//! in memory only once that write succeeded, so a failed write leaves
//! both copies as they were. Owners never share a file, a lock or a write.
//! Progress-only updates are carried by the owner's next write.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::utils::path_safe_digest;
use super::error::{JobError, JobResult};
use super::lifecycle::apply_event;
use super::store::{Deleted, JobStore, MemoryJobStore, PartitionSnapshot, StoreLimits};
use super::types::{JobEvent, JobId, JobRecord, JobStatus, MediaRef, OwnerId};

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Snapshot format version
const SNAPSHOT_VERSION: u32 = 1;

/// Failure reason recorded for transfers cut short by a restart.
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

/// Extension of snapshot files inside the state directory.
const SNAPSHOT_EXTENSION: &str = "json";

/// On-disk image of one owner's partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Version for future migrations
    pub version: u32,
    /// When the snapshot was last written
    pub last_saved: Option<DateTime<Utc>>,
    /// Owner of every record in the partition
    pub owner_id: OwnerId,
    pub partition: PartitionSnapshot,
}

impl JobSnapshot {
    pub fn new(owner_id: OwnerId, partition: PartitionSnapshot) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            last_saved: None,
            owner_id,
            partition,
        }
    }

    /// Get the lock file path for a snapshot file.
    ///
    /// A separate .lock file lets us hold the lock across the atomic rename.
    fn lock_path(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    /// Acquire an exclusive lock with timeout.
    fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}. \
                             Another instance may be writing the job snapshot.",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
                }
            }
        }
    }

    /// Acquire a shared lock with timeout.
    fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            match FileExt::try_lock_shared(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!("Timed out waiting for shared lock after {:?}", timeout);
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| "Failed to acquire shared lock on job snapshot");
                }
            }
        }
    }

    /// Load one owner's snapshot.
    pub fn load(path: &Path) -> Result<Self> {
        let lock_path = Self::lock_path(path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;
        Self::acquire_shared_lock_with_timeout(&lock_file, LOCK_TIMEOUT)?;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read job snapshot {:?}", path))?;
        let snapshot: JobSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse job snapshot {:?}", path))?;

        if snapshot.version > SNAPSHOT_VERSION {
            bail!(
                "Job snapshot {:?} has version {}, newer than supported version {}",
                path,
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }
        Ok(snapshot)
    }

    /// Write the snapshot with an exclusive lock, temp file and atomic rename.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard = Self::acquire_exclusive_lock_with_timeout(&Self::lock_path(path), LOCK_TIMEOUT)?;
        let temp_path = path.with_extension("tmp");

        self.last_saved = Some(Utc::now());
        let content = serde_json::to_string_pretty(self)
            .with_context(|| "Failed to serialize job snapshot")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} -> {:?}", temp_path, path))?;
        Ok(())
    }

    /// Fail every transfer that was running when the previous process
    /// stopped. Queued jobs stay queued and are dispatched again.
    ///
    /// Returns the number of jobs that were failed.
    pub fn fail_interrupted(&mut self) -> usize {
        let mut failed = 0;
        for record in self.partition.jobs.iter_mut().filter(|r| r.status == JobStatus::Downloading) {
            let event = JobEvent::Failed {
                reason: INTERRUPTED_REASON.to_string(),
            };
            if apply_event(record, &event).is_ok() {
                failed += 1;
            }
        }
        failed
    }
}

/// Job store that survives restarts.
pub struct PersistentJobStore {
    inner: MemoryJobStore,
    dir: PathBuf,
}

impl PersistentJobStore {
    /// Open (or create) the state directory at `dir` and load every owner.
    pub fn open(dir: impl Into<PathBuf>, limits: StoreLimits) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create state directory {:?}", dir))?;

        let mut partitions = BTreeMap::new();
        let mut interrupted = 0;
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read state directory {:?}", dir))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            let mut snapshot = JobSnapshot::load(&path)?;
            if path != snapshot_path(&dir, &snapshot.owner_id) {
                bail!("Job snapshot {:?} belongs to another owner", path);
            }
            let failed = snapshot.fail_interrupted();
            if failed > 0 {
                snapshot.save(&path)?;
                interrupted += failed;
            }
            partitions.insert(snapshot.owner_id, snapshot.partition);
        }
        if interrupted > 0 {
            tracing::warn!(count = interrupted, "Marked interrupted downloads as failed");
        }

        tracing::info!(path = ?dir, owners = partitions.len(), "Job snapshots loaded");
        Ok(Self {
            inner: MemoryJobStore::restore(partitions, limits),
            dir,
        })
    }

    /// The state directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot file holding `owner`'s partition.
    pub fn owner_path(&self, owner: &OwnerId) -> PathBuf {
        snapshot_path(&self.dir, owner)
    }

    /// Write the next image of `owner`'s partition.
    fn persist(&self, owner: &OwnerId, image: &PartitionSnapshot) -> JobResult<()> {
        let path = self.owner_path(owner);
        JobSnapshot::new(owner.clone(), image.clone()).save(&path).map_err(|e| {
            tracing::error!(owner = %owner, path = ?path, error = %format!("{:#}", e), "Failed to write job snapshot");
            JobError::Storage(e.to_string())
        })
    }
}

fn snapshot_path(dir: &Path, owner: &OwnerId) -> PathBuf {
    dir.join(path_safe_digest(owner.as_str()))
        .with_extension(SNAPSHOT_EXTENSION)
}

impl JobStore for PersistentJobStore {
    fn create(&self, owner: &OwnerId, media_ref: MediaRef) -> JobResult<JobRecord> {
        self.inner
            .create_with(owner, media_ref, |image| self.persist(owner, image))
    }

    fn get(&self, owner: &OwnerId, id: JobId) -> JobResult<JobRecord> {
        self.inner.get(owner, id)
    }

    fn list(&self, owner: &OwnerId) -> JobResult<Vec<JobRecord>> {
        self.inner.list(owner)
    }

    fn owners(&self) -> JobResult<Vec<OwnerId>> {
        self.inner.owners()
    }

    fn update(&self, owner: &OwnerId, id: JobId, event: &JobEvent) -> JobResult<JobRecord> {
        if event.changes_status() {
            self.inner
                .update_with(owner, id, event, |image| self.persist(owner, image))
        } else {
            self.inner.update(owner, id, event)
        }
    }

    fn delete(&self, owner: &OwnerId, id: JobId) -> JobResult<Deleted> {
        self.inner
            .delete_with(owner, id, |image| self.persist(owner, image))
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job store: the only owner of job records.
//!
//! Records are partitioned by owner. Locking discipline:
//!
//! - the partition map lock is held only long enough to find or insert a
//!   partition, so owners never block one another;
//! - each partition has its own lock guarding id allocation, membership
//!   and creation order;
//! - each record has its own mutex, taken while holding the partition
//!   lock (partition, then record; never the other way around).
//!
//! Reads and updates share the partition lock, so updates to different
//! jobs of one owner run in parallel while updates to the same job are
//! serialized by its mutex.
//!
//! The `*_with` mutations take the partition lock exclusively and hand the
//! owner's next image to a gate before committing. A gate error leaves the
//! partition untouched; durable stores persist the image there.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::security::{resilient_lock, resilient_read, resilient_write};
use super::error::{JobError, JobResult};
use super::lifecycle::{apply_event, check_invariants};
use super::types::{JobEvent, JobId, JobRecord, MediaRef, OwnerId};

/// Default cap on jobs kept per owner.
pub const DEFAULT_MAX_JOBS_PER_OWNER: usize = 500;

/// Result of a delete.
#[derive(Debug, Clone, PartialEq)]
pub enum Deleted {
    /// The record existed and is gone now
    Removed(JobRecord),
    /// The id was issued in this partition but the record was already removed
    AlreadyRemoved,
}

/// Storage contract for job records.
///
/// Every operation is scoped to one owner; a record is never visible
/// through another owner's partition. Implementations must serialize
/// mutations per record and reject any update that breaks the lifecycle.
pub trait JobStore: Send + Sync {
    /// Allocate a new queued job for `owner`.
    fn create(&self, owner: &OwnerId, media_ref: MediaRef) -> JobResult<JobRecord>;

    /// Copy of one record.
    fn get(&self, owner: &OwnerId, id: JobId) -> JobResult<JobRecord>;

    /// Copies of all records of `owner`, in creation order.
    fn list(&self, owner: &OwnerId) -> JobResult<Vec<JobRecord>>;

    /// Owners that have a partition, in no particular order.
    fn owners(&self) -> JobResult<Vec<OwnerId>>;

    /// Apply a lifecycle event and return the resulting record.
    fn update(&self, owner: &OwnerId, id: JobId, event: &JobEvent) -> JobResult<JobRecord>;

    /// Remove a record regardless of its status.
    fn delete(&self, owner: &OwnerId, id: JobId) -> JobResult<Deleted>;
}

/// Limits applied by the in-memory store.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_jobs_per_owner: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_jobs_per_owner: DEFAULT_MAX_JOBS_PER_OWNER,
        }
    }
}

/// Serializable image of one partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    /// Next id to hand out; ids below it have been issued
    pub next_id: JobId,
    /// Records in creation order
    pub jobs: Vec<JobRecord>,
}

#[derive(Debug)]
struct PartitionState {
    next_id: JobId,
    jobs: IndexMap<JobId, Arc<Mutex<JobRecord>>>,
}

impl PartitionState {
    fn new() -> Self {
        Self {
            next_id: 1,
            jobs: IndexMap::new(),
        }
    }

    fn was_issued(&self, id: JobId) -> bool {
        id >= 1 && id < self.next_id
    }

    fn image(&self) -> PartitionSnapshot {
        PartitionSnapshot {
            next_id: self.next_id,
            jobs: self.jobs.values().map(|cell| resilient_lock(cell).clone()).collect(),
        }
    }
}

#[derive(Debug)]
struct Partition {
    state: RwLock<PartitionState>,
}

/// In-memory, partitioned job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    partitions: RwLock<HashMap<OwnerId, Arc<Partition>>>,
    limits: StoreLimits,
}

impl MemoryJobStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            limits,
        }
    }

    /// Rebuild a store from a snapshot.
    pub fn restore(snapshot: BTreeMap<OwnerId, PartitionSnapshot>, limits: StoreLimits) -> Self {
        let mut partitions = HashMap::with_capacity(snapshot.len());
        for (owner, part) in snapshot {
            let highest = part.jobs.iter().map(|j| j.id).max().unwrap_or(0);
            let mut jobs = IndexMap::with_capacity(part.jobs.len());
            for record in part.jobs {
                jobs.insert(record.id, Arc::new(Mutex::new(record)));
            }
            let state = PartitionState {
                // Never hand out an id that a snapshot already contains.
                next_id: part.next_id.max(highest.saturating_add(1)).max(1),
                jobs,
            };
            partitions.insert(
                owner,
                Arc::new(Partition {
                    state: RwLock::new(state),
                }),
            );
        }
        Self {
            partitions: RwLock::new(partitions),
            limits,
        }
    }

    /// Consistent copy of every partition.
    pub fn snapshot(&self) -> BTreeMap<OwnerId, PartitionSnapshot> {
        let partitions: Vec<(OwnerId, Arc<Partition>)> = resilient_read(&self.partitions)
            .iter()
            .map(|(owner, p)| (owner.clone(), Arc::clone(p)))
            .collect();

        partitions
            .into_iter()
            .map(|(owner, partition)| {
                let image = resilient_read(&partition.state).image();
                (owner, image)
            })
            .collect()
    }

    fn partition(&self, owner: &OwnerId) -> Option<Arc<Partition>> {
        resilient_read(&self.partitions).get(owner).cloned()
    }

    fn partition_or_create(&self, owner: &OwnerId) -> Arc<Partition> {
        if let Some(p) = self.partition(owner) {
            return p;
        }
        let mut partitions = resilient_write(&self.partitions);
        Arc::clone(partitions.entry(owner.clone()).or_insert_with(|| {
            tracing::debug!(owner = %owner, "Creating job partition");
            Arc::new(Partition {
                state: RwLock::new(PartitionState::new()),
            })
        }))
    }
}

impl MemoryJobStore {
    /// Create a job, committing it only if `gate` accepts the owner's next
    /// partition image.
    pub fn create_with<G>(&self, owner: &OwnerId, media_ref: MediaRef, gate: G) -> JobResult<JobRecord>
    where
        G: FnOnce(&PartitionSnapshot) -> JobResult<()>,
    {
        let partition = self.partition_or_create(owner);
        let mut state = resilient_write(&partition.state);

        if state.jobs.len() >= self.limits.max_jobs_per_owner {
            return Err(JobError::StoreExhausted(format!(
                "owner already has {} jobs",
                state.jobs.len()
            )));
        }
        let id = state.next_id;
        let next = id
            .checked_add(1)
            .ok_or_else(|| JobError::StoreExhausted("job id space exhausted".to_string()))?;

        let record = JobRecord::new(id, owner.clone(), media_ref);
        let mut image = state.image();
        image.jobs.push(record.clone());
        image.next_id = next;
        gate(&image)?;

        state.jobs.insert(id, Arc::new(Mutex::new(record.clone())));
        state.next_id = next;
        Ok(record)
    }

    /// Apply an event, committing it only if `gate` accepts the owner's next
    /// partition image.
    ///
    /// Holds the partition exclusively until the gate returns, so the image
    /// cannot race with other mutations of the same owner.
    pub fn update_with<G>(&self, owner: &OwnerId, id: JobId, event: &JobEvent, gate: G) -> JobResult<JobRecord>
    where
        G: FnOnce(&PartitionSnapshot) -> JobResult<()>,
    {
        let partition = self.partition(owner).ok_or(JobError::NotFound)?;
        let state = resilient_write(&partition.state);
        let cell = state.jobs.get(&id).ok_or(JobError::NotFound)?;
        let next = advance(owner, &resilient_lock(cell), event)?;

        let image = PartitionSnapshot {
            next_id: state.next_id,
            jobs: state
                .jobs
                .iter()
                .map(|(job_id, other)| {
                    if *job_id == id {
                        next.clone()
                    } else {
                        resilient_lock(other).clone()
                    }
                })
                .collect(),
        };
        gate(&image)?;

        *resilient_lock(cell) = next.clone();
        Ok(next)
    }

    /// Remove a record, committing the removal only if `gate` accepts the
    /// owner's next partition image. The gate is not consulted when nothing
    /// is removed.
    pub fn delete_with<G>(&self, owner: &OwnerId, id: JobId, gate: G) -> JobResult<Deleted>
    where
        G: FnOnce(&PartitionSnapshot) -> JobResult<()>,
    {
        let partition = self.partition(owner).ok_or(JobError::NotFound)?;
        let mut state = resilient_write(&partition.state);
        if !state.jobs.contains_key(&id) {
            return if state.was_issued(id) {
                Ok(Deleted::AlreadyRemoved)
            } else {
                Err(JobError::NotFound)
            };
        }

        let mut image = state.image();
        image.jobs.retain(|job| job.id != id);
        gate(&image)?;

        match state.jobs.shift_remove(&id) {
            Some(cell) => {
                let record = resilient_lock(&cell).clone();
                Ok(Deleted::Removed(record))
            }
            None => Ok(Deleted::AlreadyRemoved),
        }
    }
}

/// Next state of `current` under `event`, validated but not yet committed.
fn advance(owner: &OwnerId, current: &JobRecord, event: &JobEvent) -> JobResult<JobRecord> {
    // Work on a copy so a rejected event cannot leave a half-applied record.
    let mut next = current.clone();
    apply_event(&mut next, event)?;
    if let Err(err) = check_invariants(&next) {
        tracing::error!(owner = %owner, job_id = current.id, error = %err, "Refusing update");
        return Err(err);
    }
    Ok(next)
}

fn accept_all(_: &PartitionSnapshot) -> JobResult<()> {
    Ok(())
}

impl JobStore for MemoryJobStore {
    fn create(&self, owner: &OwnerId, media_ref: MediaRef) -> JobResult<JobRecord> {
        self.create_with(owner, media_ref, accept_all)
    }

    fn get(&self, owner: &OwnerId, id: JobId) -> JobResult<JobRecord> {
        let partition = self.partition(owner).ok_or(JobError::NotFound)?;
        let state = resilient_read(&partition.state);
        let cell = state.jobs.get(&id).ok_or(JobError::NotFound)?;
        let record = resilient_lock(cell).clone();
        Ok(record)
    }

    fn list(&self, owner: &OwnerId) -> JobResult<Vec<JobRecord>> {
        let Some(partition) = self.partition(owner) else {
            return Ok(Vec::new());
        };
        let state = resilient_read(&partition.state);
        Ok(state.jobs.values().map(|cell| resilient_lock(cell).clone()).collect())
    }

    fn owners(&self) -> JobResult<Vec<OwnerId>> {
        Ok(resilient_read(&self.partitions).keys().cloned().collect())
    }

    fn update(&self, owner: &OwnerId, id: JobId, event: &JobEvent) -> JobResult<JobRecord> {
        let partition = self.partition(owner).ok_or(JobError::NotFound)?;
        let state = resilient_read(&partition.state);
        let cell = state.jobs.get(&id).ok_or(JobError::NotFound)?;
        let mut current = resilient_lock(cell);
        let next = advance(owner, &current, event)?;
        *current = next.clone();
        Ok(next)
    }

    fn delete(&self, owner: &OwnerId, id: JobId) -> JobResult<Deleted> {
        self.delete_with(owner, id, accept_all)
    }
}

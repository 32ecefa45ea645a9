// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job lifecycle: the state machine and the controller that drives it.
//!
//! ```text
//! queued ──accepted──▶ downloading ──succeeded──▶ completed
//!    │                   │  ▲   │
//!    │                   │  └───┘ progress (monotonic, <= 99)
//!    │                   └──failed──▶ failed
//!    └────────canceled───────────────▶ canceled
//! ```
//!
//! Workers never touch the store directly. They push [`WorkerReport`]s
//! through a [`ProgressReporter`]; one long-lived task drains the channel
//! in order and applies each event through [`JobStore::update`], which
//! serializes it against every other mutation of the same record.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use super::error::{JobError, JobResult};
use super::store::JobStore;
use super::types::{JobEvent, JobId, JobRecord, JobStatus, OwnerId};
use super::worker::AbortRegistry;

/// Highest progress a job can show before the worker reports success.
pub const MAX_IN_FLIGHT_PROGRESS: u8 = 99;

/// Outcome of applying an event to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The record changed and `updated_at` was bumped
    Changed,
    /// Valid event with no effect (e.g. a progress report below the current value)
    Unchanged,
}

/// Apply `event` to `record` according to the state table.
///
/// The event is validated before anything is written, so a rejected event
/// leaves the record exactly as it was.
pub fn apply_event(record: &mut JobRecord, event: &JobEvent) -> JobResult<Applied> {
    let from = record.status;
    match (record.status, event) {
        (JobStatus::Queued, JobEvent::Accepted) => {
            record.status = JobStatus::Downloading;
        }
        (JobStatus::Downloading, JobEvent::Progress(p)) => {
            let clamped = (*p).clamp(0, MAX_IN_FLIGHT_PROGRESS as i64) as u8;
            if clamped <= record.progress {
                return Ok(Applied::Unchanged);
            }
            record.progress = clamped;
        }
        (JobStatus::Downloading, JobEvent::Succeeded) => {
            record.status = JobStatus::Completed;
            record.progress = 100;
        }
        (JobStatus::Downloading, JobEvent::Failed { reason }) => {
            record.status = JobStatus::Failed;
            record.failure_reason = Some(reason.clone());
        }
        (JobStatus::Queued | JobStatus::Downloading, JobEvent::Canceled) => {
            record.status = JobStatus::Canceled;
        }
        _ => {
            return Err(JobError::InvalidTransition {
                from,
                event: event.name(),
            })
        }
    }

    record.updated_at = Utc::now();
    Ok(Applied::Changed)
}

/// Check the record-level invariants that every committed state must satisfy.
pub fn check_invariants(record: &JobRecord) -> JobResult<()> {
    let completed = record.status == JobStatus::Completed;
    if record.progress > 100 || (record.progress == 100) != completed {
        return Err(JobError::InvariantViolation(format!(
            "job {} violates progress invariant: status={} progress={}",
            record.id, record.status, record.progress
        )));
    }
    Ok(())
}

/// A single report pushed by a transfer worker.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub owner_id: OwnerId,
    pub job_id: JobId,
    pub event: JobEvent,
}

/// Cloneable handle a worker uses to report into the lifecycle controller.
///
/// Reports are fire-and-forget: the worker never learns whether its event
/// was accepted, and a closed controller is silently ignored.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    owner_id: OwnerId,
    job_id: JobId,
    tx: mpsc::Sender<WorkerReport>,
}

impl ProgressReporter {
    pub(crate) fn new(owner_id: OwnerId, job_id: JobId, tx: mpsc::Sender<WorkerReport>) -> Self {
        Self { owner_id, job_id, tx }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Worker accepted the job and is starting the transfer.
    pub async fn accepted(&self) {
        self.send(JobEvent::Accepted).await;
    }

    /// Worker reports a progress percentage.
    pub async fn progress(&self, percent: i64) {
        self.send(JobEvent::Progress(percent)).await;
    }

    /// Worker finished the transfer.
    pub async fn succeeded(&self) {
        self.send(JobEvent::Succeeded).await;
    }

    /// Worker gave up.
    pub async fn failed(&self, reason: impl Into<String>) {
        self.send(JobEvent::Failed { reason: reason.into() }).await;
    }

    async fn send(&self, event: JobEvent) {
        let report = WorkerReport {
            owner_id: self.owner_id.clone(),
            job_id: self.job_id,
            event,
        };
        if self.tx.send(report).await.is_err() {
            tracing::debug!(
                owner = %self.owner_id,
                job_id = self.job_id,
                "Lifecycle controller closed, dropping worker report"
            );
        }
    }
}

/// Drives jobs through the state machine on behalf of transfer workers.
pub struct LifecycleController {
    store: Arc<dyn JobStore>,
    aborts: Arc<AbortRegistry>,
}

impl LifecycleController {
    pub fn new(store: Arc<dyn JobStore>, aborts: Arc<AbortRegistry>) -> Self {
        Self { store, aborts }
    }

    /// Apply one event to a job and return the resulting record.
    ///
    /// Invalid transitions are logged and returned; the record keeps its
    /// previous state.
    pub fn apply(&self, owner: &OwnerId, id: JobId, event: JobEvent) -> JobResult<JobRecord> {
        match self.store.update(owner, id, &event) {
            Ok(record) => {
                tracing::debug!(
                    owner = %owner,
                    job_id = id,
                    event = event.name(),
                    status = %record.status,
                    progress = record.progress,
                    "Applied job event"
                );
                if record.status.is_terminal() {
                    self.aborts.release(owner, id);
                    tracing::info!(owner = %owner, job_id = id, status = %record.status, "Job finished");
                }
                Ok(record)
            }
            Err(err @ JobError::InvalidTransition { from, event: name }) => {
                if from == JobStatus::Canceled {
                    tracing::debug!(
                        owner = %owner,
                        job_id = id,
                        event = name,
                        "Ignoring report for canceled job"
                    );
                } else {
                    tracing::warn!(
                        owner = %owner,
                        job_id = id,
                        from = %from,
                        event = name,
                        "Rejected invalid job transition"
                    );
                }
                Err(err)
            }
            Err(JobError::NotFound) => {
                // The job is gone; a worker still holding its signal is told to stop.
                self.aborts.release(owner, id);
                tracing::debug!(owner = %owner, job_id = id, event = event.name(), "Report for deleted job");
                Err(JobError::NotFound)
            }
            Err(err) => {
                tracing::error!(owner = %owner, job_id = id, error = %err, "Failed to apply job event");
                // The worker has stopped even though its last report was not stored.
                if matches!(event, JobEvent::Succeeded | JobEvent::Failed { .. }) {
                    self.aborts.release(owner, id);
                }
                Err(err)
            }
        }
    }

    /// Consume worker reports until every sender is dropped.
    ///
    /// Reports are applied one at a time, in arrival order, on the blocking
    /// pool since a durable store writes to disk.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<WorkerReport>) {
        while let Some(report) = rx.recv().await {
            let controller = Arc::clone(&self);
            let applied = tokio::task::spawn_blocking(move || {
                // Errors are already logged by apply; the worker is not told.
                let _ = controller.apply(&report.owner_id, report.job_id, report.event);
            })
            .await;
            if let Err(e) = applied {
                tracing::error!(error = %e, "Worker report task panicked");
            }
        }
        tracing::debug!("Lifecycle controller stopped");
    }
}

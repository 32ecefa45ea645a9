// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: the façade callers use to create, inspect and cancel jobs.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::error::{JobError, JobResult};
use super::lifecycle::{LifecycleController, ProgressReporter, WorkerReport};
use super::store::{Deleted, JobStore};
use super::types::{JobDetails, JobEvent, JobId, JobRecord, JobStatus, JobStatusView, MediaRef, OwnerId};
use super::worker::{AbortRegistry, TransferJob, TransferWorker};

/// Default capacity of the worker report channel.
pub const DEFAULT_REPORT_BUFFER: usize = 256;

/// Tuning knobs for the manager.
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// Worker reports buffered before reporters wait
    pub report_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            report_buffer: DEFAULT_REPORT_BUFFER,
        }
    }
}

/// Manager for offline downloads.
///
/// Every operation is scoped to the caller's identity. A job that belongs
/// to someone else is reported as not found, never as forbidden.
pub struct DownloadManager {
    store: Arc<dyn JobStore>,
    controller: Arc<LifecycleController>,
    reports_tx: mpsc::Sender<WorkerReport>,
    aborts: Arc<AbortRegistry>,
    worker: Arc<dyn TransferWorker>,
}

impl DownloadManager {
    /// Create a manager and start its lifecycle controller.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn JobStore>, worker: Arc<dyn TransferWorker>, config: ManagerConfig) -> Self {
        let aborts = Arc::new(AbortRegistry::new());
        let controller = Arc::new(LifecycleController::new(Arc::clone(&store), Arc::clone(&aborts)));
        let (reports_tx, reports_rx) = mpsc::channel(config.report_buffer.max(1));

        tokio::spawn(Arc::clone(&controller).run(reports_rx));

        Self {
            store,
            controller,
            reports_tx,
            aborts,
            worker,
        }
    }

    /// Create a job for `owner` and hand it to the transfer worker.
    pub fn create(&self, owner: &OwnerId, media_ref: &str) -> JobResult<JobDetails> {
        let media_ref = MediaRef::parse(media_ref)?;
        let record = self.store.create(owner, media_ref)?;
        tracing::info!(owner = %owner, job_id = record.id, media = %record.media_ref, "Download queued");

        self.dispatch(&record);
        Ok(record.details())
    }

    /// Reduced status of one job.
    pub fn get_status(&self, owner: &OwnerId, id: JobId) -> JobResult<JobStatusView> {
        Ok(self.store.get(owner, id)?.status_view())
    }

    /// Full record of one job.
    pub fn get_full(&self, owner: &OwnerId, id: JobId) -> JobResult<JobDetails> {
        Ok(self.store.get(owner, id)?.details())
    }

    /// Every job of `owner`, in creation order.
    pub fn list_all(&self, owner: &OwnerId) -> JobResult<Vec<JobDetails>> {
        Ok(self.store.list(owner)?.iter().map(JobRecord::details).collect())
    }

    /// Cancel a job and remove it, whatever its status.
    ///
    /// Repeating the call for the same job succeeds. An id that was never
    /// issued to `owner` is `NotFound`.
    pub fn cancel(&self, owner: &OwnerId, id: JobId) -> JobResult<()> {
        let signaled = self.aborts.signal(owner, id);

        match self.store.update(owner, id, &JobEvent::Canceled) {
            Ok(_) => {}
            // Terminal jobs are removed without a status change; a missing
            // record is settled by the delete below.
            Err(JobError::InvalidTransition { .. }) | Err(JobError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let deleted = self.store.delete(owner, id);
        self.aborts.release(owner, id);

        match deleted? {
            Deleted::Removed(record) => {
                tracing::info!(
                    owner = %owner,
                    job_id = id,
                    previous_status = %record.status,
                    worker_signaled = signaled,
                    "Download canceled"
                );
            }
            Deleted::AlreadyRemoved => {
                tracing::debug!(owner = %owner, job_id = id, "Download already canceled");
            }
        }
        Ok(())
    }

    /// Hand every queued job to the worker again. Used after a restart.
    ///
    /// Returns the number of jobs dispatched.
    pub fn resume_queued(&self) -> JobResult<usize> {
        let mut dispatched = 0;
        for owner in self.store.owners()? {
            for record in self.store.list(&owner)? {
                if record.status == JobStatus::Queued {
                    self.dispatch(&record);
                    dispatched += 1;
                }
            }
        }
        if dispatched > 0 {
            tracing::info!(count = dispatched, "Resumed queued downloads");
        }
        Ok(dispatched)
    }

    /// Signal every running transfer to stop.
    ///
    /// Records are left as they are; a durable store marks interrupted
    /// transfers on its next load.
    pub fn shutdown(&self) -> usize {
        let signaled = self.aborts.signal_all();
        tracing::info!(transfers = signaled, "Download manager shutting down");
        signaled
    }

    /// Jobs whose worker may still be running.
    pub fn active_transfers(&self) -> usize {
        self.aborts.len()
    }

    /// The controller applying worker reports.
    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    fn dispatch(&self, record: &JobRecord) {
        let abort = self.aborts.register(&record.owner_id, record.id);
        let reporter = ProgressReporter::new(record.owner_id.clone(), record.id, self.reports_tx.clone());
        self.worker.start(TransferJob {
            owner_id: record.owner_id.clone(),
            job_id: record.id,
            media_ref: record.media_ref.clone(),
            reporter,
            abort,
        });
    }
}

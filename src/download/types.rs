// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download job types: identities, the job record and its read projections.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::JobError;

/// Identifier of a job, unique within one owner's partition.
pub type JobId = u64;

/// Maximum length of a media reference in bytes.
pub const MAX_MEDIA_REF_LEN: usize = 256;

/// Opaque caller identity that owns a set of jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to the media item being downloaded.
///
/// The manager never interprets it, but workers commonly use it to build
/// URLs and cache paths, so anything that could escape a path segment is
/// rejected up front.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(String);

impl MediaRef {
    /// Validate and wrap a media reference.
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        if raw.trim().is_empty() {
            return Err(JobError::InvalidMediaRef("must not be empty"));
        }
        if raw.trim() != raw {
            return Err(JobError::InvalidMediaRef("must not start or end with whitespace"));
        }
        if raw.len() > MAX_MEDIA_REF_LEN {
            return Err(JobError::InvalidMediaRef("too long"));
        }
        if raw.chars().any(|c| c.is_control()) {
            return Err(JobError::InvalidMediaRef("contains control characters"));
        }
        if raw.contains('/') || raw.contains('\\') || raw.contains("..") {
            return Err(JobError::InvalidMediaRef("contains path separators"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker to pick it up
    Queued,
    /// Bytes are being transferred
    Downloading,
    /// Available for offline playback
    Completed,
    /// Transfer gave up
    Failed,
    /// Canceled by the owner
    Canceled,
}

impl JobStatus {
    /// Returns true if no further transition is permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled)
    }

    /// Returns true while a worker may still be reporting.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Human-readable label shown to users. This is the only place the
    /// label is derived, so it cannot drift from `self`.
    pub fn display_label(&self) -> &'static str {
        match self {
            JobStatus::Queued => "Waiting in queue",
            JobStatus::Downloading => "Downloading",
            JobStatus::Completed => "Available offline",
            JobStatus::Failed => "Download failed",
            JobStatus::Canceled => "Canceled",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events reported by the transfer worker or the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Worker picked the job up
    Accepted,
    /// Worker reports a progress percentage (clamped on apply)
    Progress(i64),
    /// Worker finished the transfer
    Succeeded,
    /// Worker gave up
    Failed { reason: String },
    /// Owner canceled the job
    Canceled,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Accepted => "accepted",
            JobEvent::Progress(_) => "progress",
            JobEvent::Succeeded => "succeeded",
            JobEvent::Failed { .. } => "failed",
            JobEvent::Canceled => "canceled",
        }
    }

    /// Returns true for events that change `status`, as opposed to
    /// progress-only reports.
    pub fn changes_status(&self) -> bool {
        !matches!(self, JobEvent::Progress(_))
    }
}

/// One tracked offline download.
///
/// Only the store mutates records; everything handed out is a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Per-owner identifier
    pub id: JobId,
    /// Identity that created the job
    pub owner_id: OwnerId,
    /// Item being downloaded
    pub media_ref: MediaRef,
    /// Current status
    pub status: JobStatus,
    /// Percentage in [0, 100]
    pub progress: u8,
    /// Reason given by the worker when the job failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job was last mutated
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a fresh queued record.
    pub fn new(id: JobId, owner_id: OwnerId, media_ref: MediaRef) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            media_ref,
            status: JobStatus::Queued,
            progress: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Label derived from the current status.
    pub fn status_display(&self) -> &'static str {
        self.status.display_label()
    }

    /// Reduced projection used for polling.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            status: self.status,
            status_display: self.status_display(),
            progress: self.progress,
        }
    }

    /// Full projection as served to clients.
    pub fn details(&self) -> JobDetails {
        JobDetails {
            id: self.id,
            owner_id: self.owner_id.clone(),
            media_ref: self.media_ref.clone(),
            status: self.status,
            status_display: self.status_display(),
            progress: self.progress,
            failure_reason: self.failure_reason.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Status-only projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub status_display: &'static str,
    pub progress: u8,
}

/// Full projection of a job, including the derived label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDetails {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub media_ref: MediaRef,
    pub status: JobStatus,
    pub status_display: &'static str,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

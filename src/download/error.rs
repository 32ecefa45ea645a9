// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Errors raised by the download job subsystem.

use thiserror::Error;

use super::types::JobStatus;

/// Errors that can occur while creating, tracking or canceling jobs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// No valid caller identity
    #[error("Caller identity missing or not recognized")]
    Unauthorized,

    /// Job id is not a well-formed identifier
    #[error("Malformed job id: {0}")]
    InvalidId(String),

    /// Media reference rejected before a job was created
    #[error("Invalid media reference: {0}")]
    InvalidMediaRef(&'static str),

    /// No visible record for that id under that identity
    #[error("Download job not found")]
    NotFound,

    /// Event does not match any row of the state table
    #[error("Invalid transition: {event} while {from}")]
    InvalidTransition { from: JobStatus, event: &'static str },

    /// Per-owner limit or id space exhausted
    #[error("Job store exhausted: {0}")]
    StoreExhausted(String),

    /// A transition would have produced a record that breaks a lifecycle invariant
    #[error("Job invariant violated: {0}")]
    InvariantViolation(String),

    /// Backing storage failed
    #[error("Job storage failure: {0}")]
    Storage(String),
}

impl JobError {
    /// Returns true for conditions the caller can act on directly.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            JobError::Unauthorized
                | JobError::InvalidId(_)
                | JobError::InvalidMediaRef(_)
                | JobError::NotFound
        )
    }
}

/// Result alias for job operations.
pub type JobResult<T> = Result<T, JobError>;

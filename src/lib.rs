// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! tapedeck - Offline download manager library
//!
//! Users ask for media to be made available offline; tapedeck tracks each
//! request as a download job, drives it through its lifecycle as the
//! transfer proceeds, and lets the owner poll or cancel it.
//!
//! **create** -> **queued** -> **downloading** -> **completed / failed / canceled**
//!
//! # Core Modules
//!
//! - [`download`] - Job records, the partitioned store, lifecycle and façade
//! - [`transfer`] - HTTP transfer worker writing into the media cache
//! - [`server`] - HTTP API
//! - [`security`] - Caller identity and poison-recovering locks
//! - [`errors`] - User-facing API errors with reference codes
//! - [`config`] - `~/.tapedeck/config.json`

pub mod config;
pub mod download;
pub mod errors;
pub mod security;
pub mod server;
pub mod transfer;
pub mod utils;

// Re-export the download façade and its types
pub use download::{
    DownloadManager, JobDetails, JobError, JobEvent, JobId, JobRecord, JobStatus, JobStatusView,
    JobStore, ManagerConfig, MediaRef, MemoryJobStore, OwnerId, PersistentJobStore, StoreLimits,
};

pub use config::{load_config, save_config, Config};
pub use errors::{generate_reference_code, map_job_error, sanitize_error_details, ApiResult, ErrorResponse, UserError};
pub use security::{IdentityResolver, TokenGrant, TokenResolver};
pub use server::{Server, ServerLimits};
pub use transfer::{HttpTransferWorker, TransferSettings};
pub use utils::mask_sensitive;

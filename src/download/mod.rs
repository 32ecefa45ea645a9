// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline download jobs for tapedeck
//!
//! This module tracks the downloads each user has asked for:
//! - Per-owner job partitions with sequential ids
//! - A lifecycle state machine fed by transfer workers
//! - Cancellation that stops the worker and removes the record
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  create/cancel  ┌─────────────────┐
//! │ DownloadManager │────────────────▶│ JobStore        │
//! │ (façade)        │                 │ (partitioned)   │
//! └────────┬────────┘                 └────────▲────────┘
//!          │ start(TransferJob)                │ update
//!          ▼                                   │
//! ┌─────────────────┐  WorkerReport   ┌────────┴────────┐
//! │ TransferWorker  │────────────────▶│ Lifecycle       │
//! │ (HTTP, tests)   │     (mpsc)      │ Controller      │
//! └─────────────────┘                 └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tapedeck::download::{DownloadManager, ManagerConfig, MemoryJobStore, OwnerId, StoreLimits};
//! use tapedeck::transfer::{HttpTransferWorker, TransferSettings};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryJobStore::new(StoreLimits::default()));
//! let worker = Arc::new(HttpTransferWorker::new(TransferSettings::default())?);
//! let manager = DownloadManager::new(store, worker, ManagerConfig::default());
//!
//! let owner = OwnerId::new("42");
//! let job = manager.create(&owner, "album-3-track-7")?;
//! println!("{}: {}", job.id, job.status_display);
//!
//! manager.cancel(&owner, job.id)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;

pub use error::{JobError, JobResult};
pub use lifecycle::{apply_event, Applied, LifecycleController, ProgressReporter, WorkerReport};
pub use manager::{DownloadManager, ManagerConfig};
pub use state::{JobSnapshot, PersistentJobStore};
pub use store::{Deleted, JobStore, MemoryJobStore, PartitionSnapshot, StoreLimits};
pub use types::{JobDetails, JobEvent, JobId, JobRecord, JobStatus, JobStatusView, MediaRef, OwnerId};
pub use worker::{AbortRegistry, AbortSignal, TransferJob, TransferWorker};

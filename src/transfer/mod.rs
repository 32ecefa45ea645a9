// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transfer worker.
//!
//! Streams `{media_base_url}/{media_ref}` into the owner's cache directory.
//! Bytes land in a `.part` file first and are renamed into place only after
//! the whole body arrived, so a cached file is always complete.
//!
//! ```text
//! {cache_dir}/
//!   └── {sha256(owner_id)[..16] hex}/
//!         ├── album-3-track-7          complete
//!         └── album-3-track-8.part     in flight
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::download::{AbortSignal, MediaRef, OwnerId, ProgressReporter, TransferJob, TransferWorker};
use crate::utils::path_safe_digest;

/// Default base URL media refs are resolved against.
pub const DEFAULT_MEDIA_BASE_URL: &str = "http://127.0.0.1:8090/media";

/// Default connect timeout for the media server.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Suffix of files still being written.
const PART_SUFFIX: &str = ".part";

/// Where transfers come from and where they go.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Base URL; the media ref is appended as the last path segment
    pub media_base_url: String,
    /// Root of the per-owner cache directories
    pub cache_dir: PathBuf,
    pub connect_timeout: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            media_base_url: DEFAULT_MEDIA_BASE_URL.to_string(),
            cache_dir: default_cache_dir(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Platform cache directory for tapedeck.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tapedeck")
}

/// Outcome of a transfer that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferOutcome {
    Completed(u64),
    Aborted,
}

/// Transfer worker that downloads media over HTTP.
#[derive(Clone)]
pub struct HttpTransferWorker {
    client: reqwest::Client,
    settings: Arc<TransferSettings>,
}

impl HttpTransferWorker {
    pub fn new(settings: TransferSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .context("Failed to create HTTP client for media transfers")?;

        Ok(Self {
            client,
            settings: Arc::new(settings),
        })
    }

    /// URL the media item is fetched from.
    pub fn media_url(&self, media_ref: &MediaRef) -> String {
        format!(
            "{}/{}",
            self.settings.media_base_url.trim_end_matches('/'),
            media_ref.as_str()
        )
    }

    /// Final location of a downloaded item.
    pub fn cache_path(&self, owner: &OwnerId, media_ref: &MediaRef) -> PathBuf {
        self.settings
            .cache_dir
            .join(path_safe_digest(owner.as_str()))
            .join(media_ref.as_str())
    }
}

impl TransferWorker for HttpTransferWorker {
    fn start(&self, job: TransferJob) {
        let url = self.media_url(&job.media_ref);
        let dest = self.cache_path(&job.owner_id, &job.media_ref);
        let client = self.client.clone();
        tokio::spawn(run_transfer(client, url, dest, job));
    }
}

async fn run_transfer(client: reqwest::Client, url: String, dest: PathBuf, job: TransferJob) {
    let TransferJob {
        owner_id,
        job_id,
        reporter,
        mut abort,
        ..
    } = job;

    if abort.is_aborted() {
        tracing::debug!(owner = %owner_id, job_id, "Transfer aborted before start");
        return;
    }
    reporter.accepted().await;

    let part = part_path(&dest);
    let result = fetch(&client, &url, &dest, &part, &reporter, &mut abort).await;
    if !matches!(result, Ok(TransferOutcome::Completed(_))) {
        remove_partial(&part).await;
    }

    match result {
        Ok(TransferOutcome::Completed(bytes)) => {
            tracing::info!(owner = %owner_id, job_id, bytes, "Transfer complete");
            reporter.succeeded().await;
        }
        Ok(TransferOutcome::Aborted) => {
            tracing::info!(owner = %owner_id, job_id, "Transfer aborted");
        }
        Err(e) => {
            tracing::warn!(owner = %owner_id, job_id, error = %format!("{:#}", e), "Transfer failed");
            // Only the outermost context is shown to the owner.
            reporter.failed(e.to_string()).await;
        }
    }
}

async fn fetch(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    part: &Path,
    reporter: &ProgressReporter,
    abort: &mut AbortSignal,
) -> Result<TransferOutcome> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create cache directory")?;
    }

    let response = tokio::select! {
        response = client.get(url).send() => response.context("Media server unreachable")?,
        _ = abort.aborted() => return Ok(TransferOutcome::Aborted),
    };
    let status = response.status();
    if !status.is_success() {
        bail!("Media server returned {}", status);
    }

    let total = response.content_length().filter(|len| *len > 0);
    let mut stream = response.bytes_stream();
    let mut file = tokio::fs::File::create(part)
        .await
        .context("Failed to create cache file")?;

    let mut written: u64 = 0;
    let mut last_percent: i64 = 0;

    while let Some(chunk) = tokio::select! {
        chunk = stream.next() => chunk,
        _ = abort.aborted() => return Ok(TransferOutcome::Aborted),
    } {
        let chunk = chunk.context("Transfer interrupted")?;
        file.write_all(&chunk)
            .await
            .context("Failed to write cache file")?;
        written += chunk.len() as u64;

        if let Some(total) = total {
            let percent = (written.saturating_mul(100) / total) as i64;
            if percent > last_percent {
                last_percent = percent;
                reporter.progress(percent).await;
            }
        }
    }

    if let Some(total) = total {
        if written < total {
            bail!("Transfer ended early ({} of {} bytes)", written, total);
        }
    }

    file.flush().await.context("Failed to write cache file")?;
    file.sync_all().await.context("Failed to sync cache file")?;
    drop(file);

    tokio::fs::rename(part, dest)
        .await
        .context("Failed to move download into cache")?;
    Ok(TransferOutcome::Completed(written))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

async fn remove_partial(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = ?part, error = %e, "Failed to remove partial download"),
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The seam between the manager and whatever actually moves bytes.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::watch;

use crate::security::{resilient_read, resilient_write};
use super::lifecycle::ProgressReporter;
use super::types::{JobId, MediaRef, OwnerId};

/// Everything a worker needs to run one transfer.
#[derive(Debug)]
pub struct TransferJob {
    pub owner_id: OwnerId,
    pub job_id: JobId,
    pub media_ref: MediaRef,
    /// Channel back into the lifecycle controller
    pub reporter: ProgressReporter,
    /// Fires when the owner cancels or the manager shuts down
    pub abort: AbortSignal,
}

/// Performs transfers. Implementations own sockets, files and retries.
///
/// `start` must return immediately; long-running work belongs on a
/// spawned task.
pub trait TransferWorker: Send + Sync {
    fn start(&self, job: TransferJob);
}

/// Receiving side of a job's abort flag.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// Returns true once an abort was requested.
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when an abort is requested.
    ///
    /// Also resolves if the registry entry is gone (job finished or
    /// manager dropped), since nobody is waiting on the transfer anymore.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Abort handles for every job that may still have a worker attached.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    senders: RwLock<HashMap<(OwnerId, JobId), watch::Sender<bool>>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job and hand back the signal its worker listens on.
    pub fn register(&self, owner: &OwnerId, id: JobId) -> AbortSignal {
        let (tx, rx) = watch::channel(false);
        resilient_write(&self.senders).insert((owner.clone(), id), tx);
        AbortSignal { rx }
    }

    /// Ask the job's worker to stop. Safe to repeat; returns false when no
    /// worker is attached anymore.
    pub fn signal(&self, owner: &OwnerId, id: JobId) -> bool {
        let senders = resilient_read(&self.senders);
        match senders.get(&(owner.clone(), id)) {
            Some(tx) => {
                // send_replace stores the flag even with no live receiver,
                // so a worker that subscribes late still sees it.
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Forget a job once its worker can no longer be running.
    pub fn release(&self, owner: &OwnerId, id: JobId) {
        resilient_write(&self.senders).remove(&(owner.clone(), id));
    }

    /// Signal every registered job. Used on shutdown.
    pub fn signal_all(&self) -> usize {
        let senders = resilient_read(&self.senders);
        for tx in senders.values() {
            tx.send_replace(true);
        }
        senders.len()
    }

    /// Number of jobs with a worker possibly attached.
    pub fn len(&self) -> usize {
        resilient_read(&self.senders).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_reaches_worker() {
        let registry = AbortRegistry::new();
        let owner = OwnerId::new("42");
        let mut signal = registry.register(&owner, 1);
        assert!(!signal.is_aborted());

        assert!(registry.signal(&owner, 1));
        assert!(registry.signal(&owner, 1), "signaling twice is fine");

        tokio::time::timeout(Duration::from_millis(200), signal.aborted())
            .await
            .expect("abort should resolve");
        assert!(signal.is_aborted());
    }

    #[test]
    fn test_signal_unknown_job() {
        let registry = AbortRegistry::new();
        assert!(!registry.signal(&OwnerId::new("42"), 9));
    }

    #[tokio::test]
    async fn test_release_unblocks_waiters() {
        let registry = AbortRegistry::new();
        let owner = OwnerId::new("42");
        let mut signal = registry.register(&owner, 1);
        registry.release(&owner, 1);
        assert!(registry.is_empty());

        tokio::time::timeout(Duration::from_millis(200), signal.aborted())
            .await
            .expect("dropped sender should resolve");
        assert!(!signal.is_aborted());
    }

    #[test]
    fn test_signal_all() {
        let registry = AbortRegistry::new();
        let a = registry.register(&OwnerId::new("a"), 1);
        let b = registry.register(&OwnerId::new("b"), 1);
        assert_eq!(registry.signal_all(), 2);
        assert!(a.is_aborted());
        assert!(b.is_aborted());
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for tapedeck
//!
//! These tests hammer the job store, lifecycle controller and façade from
//! many tasks at once. They are designed to detect data races when run
//! with ThreadSanitizer (TSAN).
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! # On Linux with nightly Rust:
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```
//!
//! # Test Categories
//!
//! - Concurrent progress reports for one job
//! - Concurrent creates (one owner, many owners)
//! - Cancel racing completion
//! - Repeated concurrent cancels
//! - Readers observing records while writers update them

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tapedeck::download::{
    DownloadManager, JobError, JobEvent, JobStatus, ManagerConfig, MemoryJobStore, OwnerId,
    StoreLimits, TransferJob, TransferWorker,
};
use tokio::time::timeout;

// Test configuration
const CONCURRENCY_LEVEL: usize = 100;
const ITERATIONS_PER_TASK: usize = 20;
const TEST_TIMEOUT_SECS: u64 = 30;

/// Worker that parks every job so the test can drive it.
#[derive(Default)]
struct ParkingWorker {
    jobs: Mutex<Vec<TransferJob>>,
}

impl ParkingWorker {
    fn take(&self) -> Vec<TransferJob> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }
}

impl TransferWorker for ParkingWorker {
    fn start(&self, job: TransferJob) {
        self.jobs.lock().unwrap().push(job);
    }
}

fn setup(limits: StoreLimits) -> (Arc<DownloadManager>, Arc<ParkingWorker>) {
    let worker = Arc::new(ParkingWorker::default());
    let store = Arc::new(MemoryJobStore::new(limits));
    let manager = Arc::new(DownloadManager::new(store, worker.clone(), ManagerConfig::default()));
    (manager, worker)
}

// =============================================================================
// PROGRESS REPORTS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_progress_reports() {
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        let (manager, _worker) = setup(StoreLimits::default());
        let owner = OwnerId::new("42");
        let id = manager.create(&owner, "song-7").unwrap().id;
        manager.controller().apply(&owner, id, JobEvent::Accepted).unwrap();

        // A reader checks progress never goes backwards while writers race.
        let reader = {
            let manager = Arc::clone(&manager);
            let owner = owner.clone();
            tokio::spawn(async move {
                let mut last = 0u8;
                for _ in 0..CONCURRENCY_LEVEL * 5 {
                    let view = manager.get_status(&owner, id).unwrap();
                    assert!(view.progress >= last, "progress went from {} to {}", last, view.progress);
                    assert!(view.progress < 100);
                    last = view.progress;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut handles = Vec::with_capacity(CONCURRENCY_LEVEL);
        for task in 0..CONCURRENCY_LEVEL {
            let manager = Arc::clone(&manager);
            let owner = owner.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..ITERATIONS_PER_TASK {
                    let percent = ((task * 7 + i * 13) % 120) as i64;
                    manager
                        .controller()
                        .apply(&owner, id, JobEvent::Progress(percent))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        reader.await.unwrap();

        // Some task reported >= 99, so the clamp ceiling was reached.
        let view = manager.get_status(&owner, id).unwrap();
        assert_eq!(view.status, JobStatus::Downloading);
        assert_eq!(view.progress, 99);

        manager.controller().apply(&owner, id, JobEvent::Succeeded).unwrap();
        let view = manager.get_status(&owner, id).unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, 100);
    })
    .await;

    assert!(result.is_ok(), "Test timed out - possible deadlock");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reporter_channel_under_load() {
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        let (manager, worker) = setup(StoreLimits::default());
        let owner = OwnerId::new("42");
        for i in 0..CONCURRENCY_LEVEL {
            manager.create(&owner, &format!("song-{}", i)).unwrap();
        }

        let mut handles = Vec::new();
        for job in worker.take() {
            handles.push(tokio::spawn(async move {
                job.reporter.accepted().await;
                for p in (0..=100).step_by(10) {
                    job.reporter.progress(p).await;
                }
                job.reporter.succeeded().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        loop {
            let jobs = manager.list_all(&owner).unwrap();
            if jobs.iter().all(|j| j.status == JobStatus::Completed) {
                assert!(jobs.iter().all(|j| j.progress == 100));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.active_transfers(), 0);
    })
    .await;

    assert!(result.is_ok(), "Test timed out - reports were lost or deadlocked");
}

// =============================================================================
// CREATES
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_same_owner() {
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        let (manager, _worker) = setup(StoreLimits {
            max_jobs_per_owner: CONCURRENCY_LEVEL * ITERATIONS_PER_TASK,
        });
        let owner = OwnerId::new("42");

        let mut handles = Vec::with_capacity(CONCURRENCY_LEVEL);
        for task in 0..CONCURRENCY_LEVEL {
            let manager = Arc::clone(&manager);
            let owner = owner.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::with_capacity(ITERATIONS_PER_TASK);
                for i in 0..ITERATIONS_PER_TASK {
                    ids.push(manager.create(&owner, &format!("t{}-{}", task, i)).unwrap().id);
                }
                ids
            }));
        }

        let mut all_ids = Vec::new();
        for handle in handles {
            all_ids.extend(handle.await.unwrap());
        }
        all_ids.sort_unstable();
        let expected: Vec<u64> = (1..=(CONCURRENCY_LEVEL * ITERATIONS_PER_TASK) as u64).collect();
        assert_eq!(all_ids, expected, "ids must be unique and gap-free");

        // Listing order matches id order because ids are allocated under the partition lock.
        let listed: Vec<u64> = manager.list_all(&owner).unwrap().iter().map(|j| j.id).collect();
        assert_eq!(listed, expected);
    })
    .await;

    assert!(result.is_ok(), "Test timed out - possible deadlock");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_across_owners() {
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        let (manager, _worker) = setup(StoreLimits::default());

        let mut handles = Vec::with_capacity(CONCURRENCY_LEVEL);
        for task in 0..CONCURRENCY_LEVEL {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let owner = OwnerId::new(format!("user-{}", task % 10));
                for i in 0..ITERATIONS_PER_TASK {
                    manager.create(&owner, &format!("song-{}", i)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for n in 0..10 {
            let owner = OwnerId::new(format!("user-{}", n));
            let jobs = manager.list_all(&owner).unwrap();
            assert_eq!(jobs.len(), 10 * ITERATIONS_PER_TASK);
            assert!(jobs.iter().all(|j| j.owner_id == owner));
            let mut ids: Vec<u64> = jobs.iter().map(|j| j.id).collect();
            ids.dedup();
            assert_eq!(ids.len(), jobs.len());
        }
    })
    .await;

    assert!(result.is_ok(), "Test timed out - possible deadlock");
}

// =============================================================================
// CANCELLATION
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_races_completion() {
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        let (manager, worker) = setup(StoreLimits::default());
        let owner = OwnerId::new("42");

        for i in 0..CONCURRENCY_LEVEL {
            manager.create(&owner, &format!("song-{}", i)).unwrap();
        }
        let jobs = worker.take();
        for job in &jobs {
            manager.controller().apply(&owner, job.job_id, JobEvent::Accepted).unwrap();
        }

        let mut handles = Vec::new();
        for job in &jobs {
            let id = job.job_id;
            let completer = {
                let manager = Arc::clone(&manager);
                let owner = owner.clone();
                tokio::spawn(async move {
                    // Either wins the race or finds the job canceled/removed.
                    match manager.controller().apply(&owner, id, JobEvent::Succeeded) {
                        Ok(record) => assert_eq!(record.status, JobStatus::Completed),
                        Err(JobError::InvalidTransition { from, .. }) => assert_eq!(from, JobStatus::Canceled),
                        Err(JobError::NotFound) => {}
                        Err(other) => panic!("unexpected error {other:?}"),
                    }
                })
            };
            let canceler = {
                let manager = Arc::clone(&manager);
                let owner = owner.clone();
                tokio::spawn(async move { manager.cancel(&owner, id) })
            };
            handles.push((completer, canceler));
        }

        for (completer, canceler) in handles {
            completer.await.unwrap();
            assert_eq!(canceler.await.unwrap(), Ok(()));
        }

        // Cancel always removes the record, whoever won.
        assert!(manager.list_all(&owner).unwrap().is_empty());
        assert_eq!(manager.active_transfers(), 0);
    })
    .await;

    assert!(result.is_ok(), "Test timed out - possible deadlock");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cancels_same_job() {
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        let (manager, _worker) = setup(StoreLimits::default());
        let owner = OwnerId::new("42");
        let id = manager.create(&owner, "song-7").unwrap().id;
        let other = manager.create(&owner, "song-8").unwrap().id;

        let mut handles = Vec::with_capacity(CONCURRENCY_LEVEL);
        for _ in 0..CONCURRENCY_LEVEL {
            let manager = Arc::clone(&manager);
            let owner = owner.clone();
            handles.push(tokio::spawn(async move { manager.cancel(&owner, id) }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }

        assert_eq!(manager.get_status(&owner, id), Err(JobError::NotFound));
        assert_eq!(manager.get_status(&owner, other).unwrap().status, JobStatus::Queued);
    })
    .await;

    assert!(result.is_ok(), "Test timed out - possible deadlock");
}

// =============================================================================
// READERS VS WRITERS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_reads_never_observe_torn_records() {
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        let (manager, _worker) = setup(StoreLimits::default());
        let owner = OwnerId::new("42");
        let ids: Vec<u64> = (0..CONCURRENCY_LEVEL)
            .map(|i| manager.create(&owner, &format!("song-{}", i)).unwrap().id)
            .collect();

        let writer = {
            let manager = Arc::clone(&manager);
            let owner = owner.clone();
            let ids = ids.clone();
            tokio::spawn(async move {
                for (n, id) in ids.into_iter().enumerate() {
                    let controller = manager.controller();
                    controller.apply(&owner, id, JobEvent::Accepted).unwrap();
                    controller.apply(&owner, id, JobEvent::Progress(100)).unwrap();
                    match n % 3 {
                        0 => {
                            controller.apply(&owner, id, JobEvent::Succeeded).unwrap();
                        }
                        1 => {
                            controller.apply(&owner, id, JobEvent::Failed { reason: "x".into() }).unwrap();
                        }
                        _ => manager.cancel(&owner, id).unwrap(),
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let owner = owner.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..ITERATIONS_PER_TASK * 10 {
                    for job in manager.list_all(&owner).unwrap() {
                        assert_eq!(
                            job.progress == 100,
                            job.status == JobStatus::Completed,
                            "torn record: {:?} at {}",
                            job.status,
                            job.progress
                        );
                        assert_eq!(job.status_display, job.status.display_label());
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    })
    .await;

    assert!(result.is_ok(), "Test timed out - possible deadlock");
}

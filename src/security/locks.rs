// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-recovering lock helpers.
//!
//! A panic while a job partition or record lock is held poisons it. Every
//! later request for that owner would then panic too, turning one bug into
//! a permanent outage for the user. These helpers log the event and hand
//! the guard back instead.
//!
//! The job store only ever replaces a record wholesale after validation,
//! so a recovered guard holds either the old record or the new one.
//!
//! ```no_run
//! use std::sync::{Mutex, RwLock};
//! use tapedeck::security::locks::{resilient_lock, resilient_read, resilient_write};
//!
//! let table = RwLock::new(vec![1, 2, 3]);
//! resilient_write(&table).push(4);
//! assert_eq!(resilient_read(&table).len(), 4);
//!
//! let record = Mutex::new(0u8);
//! *resilient_lock(&record) = 55;
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition, recovering"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition, recovering"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning if necessary.
///
/// Used for per-record locks, so it is the hot path for progress reports.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned during acquisition, recovering"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_write_then_read() {
        let lock = RwLock::new(42);
        *resilient_write(&lock) = 100;
        assert_eq!(*resilient_read(&lock), 100);
    }

    #[test]
    fn test_resilient_read_poisoned() {
        let lock = Arc::new(RwLock::new(42));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert!(lock.is_poisoned());
        assert_eq!(*resilient_read(&lock), 42);
        *resilient_write(&lock) = 7;
        assert_eq!(*resilient_read(&lock), 7);
    }

    #[test]
    fn test_resilient_lock_poisoned() {
        let lock = Arc::new(Mutex::new(String::from("queued")));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        let mut guard = resilient_lock(&lock);
        assert_eq!(*guard, "queued");
        *guard = String::from("downloading");
        drop(guard);
        assert_eq!(*resilient_lock(&lock), "downloading");
    }
}

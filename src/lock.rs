//! Poison-tolerant lock acquisition.
//!
//! Entry bookkeeping (state, owners, payload) lives behind std locks. A panic
//! while a guard is held poisons the lock; the cache favors availability, so
//! acquisition recovers the inner value and logs instead of propagating.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!(op, lock_kind = "rwlock.read", "Recovered from poisoned entry lock");
        poisoned.into_inner()
    })
}

pub(crate) fn write<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!(op, lock_kind = "rwlock.write", "Recovered from poisoned entry lock");
        poisoned.into_inner()
    })
}

pub(crate) fn lock<'a, T>(lock: &'a Mutex<T>, op: &'static str) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!(op, lock_kind = "mutex", "Recovered from poisoned entry lock");
        poisoned.into_inner()
    })
}

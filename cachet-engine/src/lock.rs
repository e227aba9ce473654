//! Lock helpers that survive poisoning.
//!
//! A panic inside a notification sink or a user closure must not take the
//! whole cache down with it, so every lock in this crate goes through these
//! helpers and keeps working on the inner value after logging.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recovered<G>(poisoned: PoisonError<G>, op: &'static str, lock_kind: &'static str) -> G {
    warn!(
        op,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered from poisoned cache lock"
    );
    poisoned.into_inner()
}

pub(crate) fn read_guard<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recovered(poisoned, op, "rwlock.read"))
}

pub(crate) fn write_guard<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recovered(poisoned, op, "rwlock.write"))
}

pub(crate) fn lock_mutex<'a, T>(lock: &'a Mutex<T>, op: &'static str) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recovered(poisoned, op, "mutex.lock"))
}

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

// A panic while holding the map lock cannot leave an entry half-written: every
// mutation is a single insert or remove. Keep serving instead of failing.
fn recover<G>(poisoned: PoisonError<G>, lock_kind: &'static str, op: &'static str) -> G {
    warn!(
        op,
        lock_kind,
        result = "poisoned_recovered",
        hint = "a thread panicked while holding the memory store lock",
        "Recovered from poisoned memory store lock"
    );
    poisoned.into_inner()
}

pub(crate) fn rw_read<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, "rwlock.read", op))
}

pub(crate) fn rw_write<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, "rwlock.write", op))
}

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a slot table, subscription list or listener set.
///
/// No user callback runs while one of these guards is held, so a poisoned
/// lock still guards consistent state and is recovered instead of
/// propagating the panic.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    owner: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!(
            op,
            owner,
            result = "poisoned_recovered",
            "Recovered poisoned lock"
        );
        poisoned.into_inner()
    })
}

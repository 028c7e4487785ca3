//! Ordered acquisition of two locks.

use spin::{Mutex, MutexGuard};

/// Two locks held together, or one lock when both sides named the same key.
pub struct PairGuard<'a, T> {
    local: MutexGuard<'a, T>,
    remote: Option<MutexGuard<'a, T>>,
}

impl<T> PairGuard<'_, T> {
    /// Whether both sides are the same lock.
    #[cfg(test)]
    pub fn is_shared(&self) -> bool {
        self.remote.is_none()
    }

    pub fn local(&mut self) -> &mut T {
        &mut self.local
    }

    #[cfg(test)]
    pub fn remote(&mut self) -> &mut T {
        match self.remote.as_mut() {
            Some(remote) => remote,
            None => &mut self.local,
        }
    }
}

/// Locks `local` and `remote` in ascending key order.
///
/// Every path that needs two of these locks goes through here, so two cores
/// working in opposite directions cannot deadlock. Equal keys must refer to
/// the same lock; it is taken once.
pub fn lock_pair<'a, K: Ord, T>(
    local: (K, &'a Mutex<T>),
    remote: (K, &'a Mutex<T>),
) -> PairGuard<'a, T> {
    let (local_key, local_lock) = local;
    let (remote_key, remote_lock) = remote;

    match local_key.cmp(&remote_key) {
        core::cmp::Ordering::Equal => PairGuard {
            local: local_lock.lock(),
            remote: None,
        },
        core::cmp::Ordering::Less => {
            let local = local_lock.lock();
            let remote = remote_lock.lock();
            PairGuard {
                local,
                remote: Some(remote),
            }
        }
        core::cmp::Ordering::Greater => {
            let remote = remote_lock.lock();
            let local = local_lock.lock();
            PairGuard {
                local,
                remote: Some(remote),
            }
        }
    }
}

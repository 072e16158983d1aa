//! HostLock - RAII guard for the host runtime's global execution lock.
//!
//! Every host job runs while holding this lock, and any thread that is not
//! a host event loop thread must take it before touching host state (for
//! example to resolve the main loop and enqueue into it).
//!
//! The lock is reentrant: a job that calls back into code taking the lock
//! again on the same thread does not deadlock.

use std::cell::Cell;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

static HOST_LOCK: ReentrantMutex<()> = parking_lot::const_reentrant_mutex(());

thread_local! {
    /// Lock depth held by this thread (for nested acquisitions).
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// RAII guard holding the host global execution lock.
///
/// # Example
///
/// ```ignore
/// let _host = HostLock::acquire();
/// // Host state may be touched here
/// ```
pub struct HostLock {
    _guard: ReentrantMutexGuard<'static, ()>,
}

impl HostLock {
    /// Block until the lock is available on this thread.
    pub fn acquire() -> Self {
        let guard = HOST_LOCK.lock();
        DEPTH.with(|d| d.set(d.get() + 1));
        tracing::trace!("Host lock acquired on {:?}", std::thread::current().id());
        Self { _guard: guard }
    }

    /// Acquire the lock only if it is free or already held by this thread.
    pub fn try_acquire() -> Option<Self> {
        let guard = HOST_LOCK.try_lock()?;
        DEPTH.with(|d| d.set(d.get() + 1));
        Some(Self { _guard: guard })
    }

    /// Whether the current thread holds the lock.
    pub fn is_held() -> bool {
        DEPTH.with(|d| d.get() > 0)
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_lock_nesting() {
        assert!(!HostLock::is_held());
        {
            let _outer = HostLock::acquire();
            assert!(HostLock::is_held());
            {
                let _inner = HostLock::acquire();
                assert!(HostLock::is_held());
            }
            assert!(HostLock::is_held());
        }
        assert!(!HostLock::is_held());
    }

    #[test]
    fn test_other_thread_waits() {
        let guard = HostLock::acquire();
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::spawn(move || {
            let acquired_early = HostLock::try_acquire().is_some();
            let _lock = HostLock::acquire();
            tx.send(acquired_early).unwrap();
        });

        // Keep the lock until the other thread has certainly tried.
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);

        let acquired_early = rx.recv().unwrap();
        handle.join().unwrap();
        assert!(!acquired_early);
    }
}

//! Serialization of read-modify-write sections over a shared backend.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;

/// Lock shared by every record store, queue and journal of one engine.
///
/// Each load, modify and persist sequence runs under it, so concurrent
/// writers never drop each other's index or queue entries. The lock is
/// reentrant: a caller holding it may still go through the store methods.
/// It is never held across an `.await`.
#[derive(Debug, Clone)]
pub struct StoreLock {
    inner: Arc<ReentrantMutex<()>>,
}

impl StoreLock {
    /// Creates an unshared lock.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Blocks until the lock is held by this thread.
    pub fn acquire(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.lock()
    }
}

impl Default for StoreLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reentrant_on_one_thread() {
        let lock = StoreLock::new();
        let _outer = lock.acquire();
        let _inner = lock.acquire();
    }

    #[test]
    fn clones_share_the_lock() {
        let lock = StoreLock::new();
        let counter = Arc::new(parking_lot::Mutex::new(0u32));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _held = lock.acquire();
                        // read and write in two steps; only the lock keeps them together
                        let seen = *counter.lock();
                        *counter.lock() = seen + 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 800);
    }
}

//! Process-wide mutual exclusion for profiling sessions.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

/// Binary free/held lock with non-blocking acquire.
///
/// This is the single arbiter for "is the engine currently sampling".
/// Acquire fails fast instead of blocking: profiling must never stall a
/// request thread waiting for another session to end. Release is
/// idempotent, since failure paths during start release without knowing
/// whether the acquire happened; releasing an unheld lock is only worth a
/// warning.
#[derive(Debug, Default)]
pub struct SessionLock {
    held: AtomicBool,
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to take the lock. Never blocks.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        if !self.held.swap(false, Ordering::Release) {
            warn!("session lock not released as it was never acquired");
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_exclusive() {
        let lock = SessionLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
    }

    #[test]
    fn test_release_without_acquire_is_recoverable() {
        let lock = SessionLock::new();
        lock.release();
        assert!(lock.try_acquire());
    }

    #[test]
    fn test_concurrent_acquire_admits_exactly_one() {
        use std::sync::Arc;

        let lock = Arc::new(SessionLock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || lock.try_acquire())
            })
            .collect();

        let acquired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|acquired| *acquired)
            .count();
        assert_eq!(1, acquired);
        assert!(lock.is_held());
    }
}

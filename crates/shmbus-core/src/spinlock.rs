//! Cross-process spinlock over a single shared-memory word
//!
//! Works for unrelated processes mapping the same page; does not rely on
//! process-shared kernel mutexes. Acquisition is bounded: a holder that died
//! inside the critical section shows up as `Error::Timeout`, never a hang.

use crate::{Error, Result};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;

/// Default acquisition bound used by the rings
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug)]
#[repr(C)]
pub struct SpinLock {
    word: AtomicI32,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicI32::new(UNLOCKED),
        }
    }

    /// Reset to unlocked. Only the segment creator calls this, before publishing it.
    pub fn init(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }

    /// Acquire, spinning for at most `timeout`.
    pub fn lock(&self, timeout: Duration) -> Result<()> {
        let begin = Instant::now();
        // test-and-test-and-set: spin on a relaxed load to keep the line shared
        while self.word.swap(LOCKED, Ordering::Acquire) == LOCKED {
            while self.word.load(Ordering::Relaxed) == LOCKED {
                if begin.elapsed() > timeout {
                    tracing::error!(lock = ?(self as *const Self), "spinlock timeout");
                    return Err(Error::Timeout);
                }
                std::hint::spin_loop();
            }
        }
        Ok(())
    }

    /// Release. Fails with `BadState` if the lock is not held.
    pub fn unlock(&self) -> Result<()> {
        if self
            .word
            .compare_exchange(LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            tracing::error!(lock = ?(self as *const Self), "spinlock is not in lock state");
            return Err(Error::BadState("spinlock not held"));
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) == LOCKED
    }

    /// Raw lock word, for diagnostics
    pub fn raw(&self) -> i32 {
        self.word.load(Ordering::Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_unlock() {
        let lock = SpinLock::new();
        lock.lock(DEFAULT_LOCK_TIMEOUT).unwrap();
        assert!(lock.is_locked());
        lock.unlock().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_lock_times_out_when_held() {
        let lock = SpinLock::new();
        lock.lock(DEFAULT_LOCK_TIMEOUT).unwrap();
        let begin = Instant::now();
        let err = lock.lock(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(begin.elapsed() >= Duration::from_millis(20));
        // the failed attempt must not have disturbed the holder
        assert!(lock.is_locked());
        lock.unlock().unwrap();
    }

    #[test]
    fn test_unlock_without_lock_is_bad_state() {
        let lock = SpinLock::new();
        assert!(matches!(lock.unlock(), Err(Error::BadState(_))));
    }

    struct Counter {
        lock: SpinLock,
        value: UnsafeCell<u64>,
    }

    unsafe impl Sync for Counter {}

    #[test]
    fn test_mutual_exclusion() {
        let counter = Arc::new(Counter {
            lock: SpinLock::new(),
            value: UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        counter.lock.lock(Duration::from_secs(5)).unwrap();
                        unsafe { *counter.value.get() += 1 };
                        counter.lock.unlock().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(unsafe { *counter.value.get() }, 40_000);
    }
}

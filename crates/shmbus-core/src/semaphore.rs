//! POSIX named semaphore wrapper
//!
//! Gives subscribers and the publisher a blocking cross-process wait with a
//! timeout instead of busy polling the rings.

use crate::shm::os_name;
use crate::{Error, Result};
use std::ffi::CString;
use std::io;
use std::time::Duration;

/// Named semaphore handle
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    owner: bool,
}

// Safety: sem_* calls are thread-safe on a valid handle.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn c_name(name: &str) -> Result<CString> {
    CString::new(os_name(name))
        .map_err(|_| Error::BadArguments(format!("semaphore name {name:?} contains NUL")))
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl NamedSemaphore {
    /// Create a new semaphore with an initial value. Fails if `name` already exists.
    ///
    /// The creator owns the name: it is unlinked when this handle is dropped.
    pub fn create(name: &str, value: u32) -> Result<Self> {
        let c = c_name(name)?;
        let mode: libc::c_uint = 0o644;
        let sem = unsafe { libc::sem_open(c.as_ptr(), libc::O_CREAT | libc::O_EXCL, mode, value) };
        if sem == libc::SEM_FAILED {
            let errno = errno();
            tracing::error!(sem = name, errno, "failed to create semaphore");
            return Err(Error::Semaphore {
                name: name.to_string(),
                errno,
            });
        }
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open an existing semaphore
    pub fn open(name: &str) -> Result<Self> {
        let c = c_name(name)?;
        let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            let errno = errno();
            tracing::error!(sem = name, errno, "failed to open semaphore");
            return Err(Error::Semaphore {
                name: name.to_string(),
                errno,
            });
        }
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Increment, waking one waiter
    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            let errno = errno();
            tracing::error!(sem = %self.name, errno, "failed to post semaphore");
            return Err(self.error(errno));
        }
        Ok(())
    }

    /// Decrement, blocking up to `timeout`. A zero timeout only tries.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return self.try_wait();
        }

        let deadline = deadline_after(timeout)?;
        loop {
            let rc = match &deadline {
                Some(deadline) => unsafe { libc::sem_timedwait(self.sem, deadline) },
                // past what CLOCK_REALTIME can express, block without a deadline
                None => unsafe { libc::sem_wait(self.sem) },
            };
            if rc == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                libc::ETIMEDOUT => return Err(Error::Timeout),
                errno => {
                    tracing::error!(sem = %self.name, errno, "failed to wait on semaphore");
                    return Err(self.error(errno));
                }
            }
        }
    }

    /// Decrement without blocking; `Timeout` if the count is zero
    pub fn try_wait(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Err(Error::Timeout),
                errno => return Err(self.error(errno)),
            }
        }
    }

    /// Drain the count to zero
    pub fn reset(&self) {
        while self.try_wait().is_ok() {}
    }

    /// Current count
    pub fn value(&self) -> Result<i32> {
        let mut v: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut v) } != 0 {
            return Err(self.error(errno()));
        }
        Ok(v)
    }

    /// Remove a semaphore name, ignoring a missing one
    pub fn unlink(name: &str) -> Result<()> {
        let c = c_name(name)?;
        if unsafe { libc::sem_unlink(c.as_ptr()) } != 0 {
            let errno = errno();
            if errno != libc::ENOENT {
                return Err(Error::Semaphore {
                    name: name.to_string(),
                    errno,
                });
            }
        }
        Ok(())
    }

    fn error(&self, errno: i32) -> Error {
        Error::Semaphore {
            name: self.name.clone(),
            errno,
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_close(self.sem) } != 0 {
            tracing::error!(sem = %self.name, errno = errno(), "failed to close semaphore");
        }
        if self.owner {
            if let Err(e) = Self::unlink(&self.name) {
                tracing::error!(sem = %self.name, error = %e, "failed to unlink semaphore");
            }
        }
    }
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now, `None` if it does not fit in a timespec
fn deadline_after(timeout: Duration) -> Result<Option<libc::timespec>> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(Error::Fail(format!(
            "clock_gettime failed: errno {}",
            errno()
        )));
    }
    let nsec = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    let tv_sec = libc::time_t::try_from(timeout.as_secs())
        .ok()
        .and_then(|secs| now.tv_sec.checked_add(secs))
        .and_then(|sec| sec.checked_add((nsec / 1_000_000_000) as libc::time_t));
    Ok(tv_sec.map(|tv_sec| libc::timespec {
        tv_sec,
        tv_nsec: (nsec % 1_000_000_000) as _,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn unique_name() -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "shmbus_sem_test_{}_{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_post_then_wait() {
        let sem = NamedSemaphore::create(&unique_name(), 0).unwrap();
        sem.post().unwrap();
        sem.post().unwrap();
        assert_eq!(sem.value().unwrap(), 2);
        sem.wait(Duration::from_millis(10)).unwrap();
        sem.try_wait().unwrap();
        assert!(matches!(sem.try_wait(), Err(Error::Timeout)));
    }

    #[test]
    fn test_wait_times_out() {
        let sem = NamedSemaphore::create(&unique_name(), 0).unwrap();
        let begin = Instant::now();
        assert!(matches!(
            sem.wait(Duration::from_millis(30)),
            Err(Error::Timeout)
        ));
        assert!(begin.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_open_shares_count_and_wakes_waiter() {
        let name = unique_name();
        let created = NamedSemaphore::create(&name, 0).unwrap();
        let opened = Arc::new(NamedSemaphore::open(&name).unwrap());

        let waiter = {
            let opened = Arc::clone(&opened);
            thread::spawn(move || opened.wait(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        created.post().unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(created.value().unwrap(), 0);
    }

    #[test]
    fn test_huge_timeout_blocks_until_post() {
        for timeout in [Duration::MAX, Duration::from_secs(i64::MAX as u64)] {
            let sem = Arc::new(NamedSemaphore::create(&unique_name(), 0).unwrap());
            let poster = {
                let sem = Arc::clone(&sem);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(100));
                    sem.post().unwrap();
                })
            };
            let begin = Instant::now();
            sem.wait(timeout).unwrap();
            assert!(begin.elapsed() >= Duration::from_millis(90));
            poster.join().unwrap();
        }
    }

    #[test]
    fn test_deadline_saturates_to_none() {
        assert!(deadline_after(Duration::MAX).unwrap().is_none());
        assert!(deadline_after(Duration::from_secs(i64::MAX as u64))
            .unwrap()
            .is_none());

        let d = deadline_after(Duration::from_millis(1500)).unwrap().unwrap();
        assert!((0..1_000_000_000).contains(&(d.tv_nsec as i64)));
    }

    #[test]
    fn test_reset_drains() {
        let sem = NamedSemaphore::create(&unique_name(), 3).unwrap();
        sem.reset();
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn test_owner_drop_unlinks_and_create_is_exclusive() {
        let name = unique_name();
        let sem = NamedSemaphore::create(&name, 0).unwrap();
        assert!(NamedSemaphore::create(&name, 0).is_err());
        drop(sem);
        assert!(NamedSemaphore::open(&name).is_err());
    }
}

//! Fixed-capacity ring of descriptor indices living in shared memory
//!
//! Only 16-bit slot indices cross the ring, never payload. `read_idx` and
//! `write_idx` are free-running 16-bit counters; occupancy is their wrapping
//! difference and the slot is `counter % NUM_DESC`.

use crate::layout::{NAME_MAX, NUM_DESC};
use crate::meta::{read_name, write_name};
use crate::spinlock::{SpinLock, DEFAULT_LOCK_TIMEOUT};
use crate::{Error, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, Ordering};

const RING_USED_BYTES: usize = std::mem::size_of::<SpinLock>()
    + std::mem::size_of::<i32>() * 2
    + std::mem::size_of::<u32>()
    + std::mem::size_of::<u16>() * (NUM_DESC + 2)
    + NAME_MAX;

/// Rings are padded to one page each
pub const RING_SIZE: usize = 4096;

#[repr(C)]
pub struct Ring {
    lock: SpinLock,
    /// Claim flag, meaningful for subscriber rings only
    pub(crate) reserved: AtomicI32,
    /// `SlotStatus` of a subscriber ring
    pub(crate) status: AtomicI32,
    queue_depth: AtomicU32,
    read_idx: AtomicU16,
    write_idx: AtomicU16,
    index: [AtomicU16; NUM_DESC],
    name: UnsafeCell<[u8; NAME_MAX]>,
    _reserved0: [u8; RING_SIZE - RING_USED_BYTES],
}

// Safety: every mutable field is atomic except `name`, which is written once by
// the ring's owner before the ring is advertised.
unsafe impl Sync for Ring {}

const _: () = assert!(std::mem::size_of::<Ring>() == RING_SIZE);
const _: () = assert!(NUM_DESC.is_power_of_two() && NUM_DESC <= u16::MAX as usize);

impl Ring {
    /// Prepare a zeroed ring for use
    pub fn init(&self, name: &str) {
        self.lock.init();
        self.set_name(name);
    }

    /// Append `idx`, returning the occupancy right after the push.
    ///
    /// Capacity is not checked: the number of live indices can never exceed the
    /// descriptor table, which has `NUM_DESC` entries.
    pub fn push(&self, idx: u16) -> Result<u32> {
        if let Err(e) = self.lock.lock(DEFAULT_LOCK_TIMEOUT) {
            tracing::error!(idx, ring = %self.name(), "ring push lock failed");
            return Err(e);
        }

        let size = self.push_locked(idx);

        self.lock.unlock().map_err(|_| {
            tracing::error!(idx, ring = %self.name(), "ring push unlock failed");
            Error::Fail(format!("unlock after push to {}", self.name()))
        })?;
        Ok(size)
    }

    /// Append `idx` and, if that leaves more than `depth` entries, take the
    /// oldest one out again under the same lock. Returns the evicted index.
    pub fn push_bounded(&self, idx: u16, depth: u32) -> Result<Option<u16>> {
        if let Err(e) = self.lock.lock(DEFAULT_LOCK_TIMEOUT) {
            tracing::error!(idx, ring = %self.name(), "ring push lock failed");
            return Err(e);
        }

        let evicted = if self.push_locked(idx) > depth.max(1) {
            self.pop_locked()
        } else {
            None
        };

        self.lock.unlock().map_err(|_| {
            tracing::error!(idx, ring = %self.name(), "ring push unlock failed");
            Error::Fail(format!("unlock after push to {}", self.name()))
        })?;
        Ok(evicted)
    }

    fn push_locked(&self, idx: u16) -> u32 {
        let r = self.read_idx.load(Ordering::Relaxed);
        let w = self.write_idx.load(Ordering::Relaxed);
        self.index[w as usize % NUM_DESC].store(idx, Ordering::Relaxed);
        let w = w.wrapping_add(1);
        self.write_idx.store(w, Ordering::Relaxed);
        w.wrapping_sub(r) as u32
    }

    fn pop_locked(&self) -> Option<u16> {
        let r = self.read_idx.load(Ordering::Relaxed);
        let w = self.write_idx.load(Ordering::Relaxed);
        if r == w {
            return None;
        }
        let idx = self.index[r as usize % NUM_DESC].load(Ordering::Relaxed);
        self.read_idx.store(r.wrapping_add(1), Ordering::Relaxed);
        Some(idx)
    }

    /// Take the oldest index, `None` when empty. An empty ring is left untouched.
    pub fn pop(&self) -> Result<Option<u16>> {
        if let Err(e) = self.lock.lock(DEFAULT_LOCK_TIMEOUT) {
            tracing::error!(ring = %self.name(), "ring pop lock failed");
            return Err(e);
        }

        let idx = self.pop_locked();

        self.lock.unlock().map_err(|_| {
            tracing::error!(ring = %self.name(), "ring pop unlock failed");
            Error::Fail(format!("unlock after pop from {}", self.name()))
        })?;
        Ok(idx)
    }

    /// Unlocked occupancy snapshot, for diagnostics only
    pub fn size(&self) -> u32 {
        let r = self.read_idx.load(Ordering::Relaxed);
        let w = self.write_idx.load(Ordering::Relaxed);
        w.wrapping_sub(r) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub(crate) fn set_queue_depth(&self, depth: u32) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn read_idx(&self) -> u16 {
        self.read_idx.load(Ordering::Relaxed)
    }

    pub fn write_idx(&self) -> u16 {
        self.write_idx.load(Ordering::Relaxed)
    }

    /// Raw ring slot `i`, for diagnostics
    pub fn slot(&self, i: usize) -> u16 {
        self.index[i % NUM_DESC].load(Ordering::Relaxed)
    }

    pub fn lock_word(&self) -> i32 {
        self.lock.raw()
    }

    pub fn name(&self) -> String {
        read_name(unsafe { &*self.name.get() })
    }

    pub(crate) fn set_name(&self, name: &str) {
        write_name(unsafe { &mut *self.name.get() }, name);
    }

    /// Whether every byte of the ring is still zero (never touched)
    pub fn is_pristine(&self) -> bool {
        let bytes = unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, std::mem::size_of::<Self>())
        };
        bytes.iter().all(|&b| b == 0)
    }

    #[cfg(test)]
    pub(crate) fn force_counters(&self, read: u16, write: u16) {
        self.read_idx.store(read, Ordering::Relaxed);
        self.write_idx.store(write, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn lock_handle(&self) -> &SpinLock {
        &self.lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::zeroed;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let ring: Box<Ring> = unsafe { zeroed() };
        ring.init("test.fifo");

        for idx in [3u16, 1, 4, 1, 5, 9, 2, 6] {
            ring.push(idx).unwrap();
        }
        assert_eq!(ring.size(), 8);

        let mut out = Vec::new();
        while let Some(idx) = ring.pop().unwrap() {
            out.push(idx);
        }
        assert_eq!(out, vec![3, 1, 4, 1, 5, 9, 2, 6]);
        assert!(ring.is_empty());
        assert_eq!(ring.name(), "test.fifo");
    }

    #[test]
    fn test_pop_empty_does_not_mutate() {
        let ring: Box<Ring> = unsafe { zeroed() };
        ring.init("test.empty");
        ring.push(7).unwrap();
        assert_eq!(ring.pop().unwrap(), Some(7));

        let (r, w) = (ring.read_idx(), ring.write_idx());
        assert_eq!(ring.pop().unwrap(), None);
        assert_eq!(ring.pop().unwrap(), None);
        assert_eq!((ring.read_idx(), ring.write_idx()), (r, w));
    }

    #[test]
    fn test_counters_wrap_at_u16() {
        let ring: Box<Ring> = unsafe { zeroed() };
        ring.init("test.wrap");
        ring.force_counters(u16::MAX - 1, u16::MAX - 1);

        for idx in 0..4u16 {
            ring.push(idx).unwrap();
        }
        assert_eq!(ring.size(), 4);
        assert_eq!(ring.write_idx(), 2);

        for idx in 0..4u16 {
            assert_eq!(ring.pop().unwrap(), Some(idx));
        }
        assert_eq!(ring.size(), 0);
    }

    #[test]
    fn test_full_cycle_through_capacity() {
        let ring: Box<Ring> = unsafe { zeroed() };
        ring.init("test.cycle");
        for round in 0..5u16 {
            for i in 0..NUM_DESC as u16 {
                ring.push(i + round).unwrap();
            }
            assert_eq!(ring.size(), NUM_DESC as u32);
            for i in 0..NUM_DESC as u16 {
                assert_eq!(ring.pop().unwrap(), Some(i + round));
            }
        }
    }

    #[test]
    fn test_push_reports_occupancy() {
        let ring: Box<Ring> = unsafe { zeroed() };
        ring.init("test.occupancy");
        assert_eq!(ring.push(1).unwrap(), 1);
        assert_eq!(ring.push(2).unwrap(), 2);
        ring.pop().unwrap();
        assert_eq!(ring.push(3).unwrap(), 2);
    }

    #[test]
    fn test_push_bounded_evicts_oldest() {
        let ring: Box<Ring> = unsafe { zeroed() };
        ring.init("test.bounded");
        assert_eq!(ring.push_bounded(10, 2).unwrap(), None);
        assert_eq!(ring.push_bounded(11, 2).unwrap(), None);
        assert_eq!(ring.push_bounded(12, 2).unwrap(), Some(10));
        assert_eq!(ring.size(), 2);

        // a consumer that caught up leaves room again
        assert_eq!(ring.pop().unwrap(), Some(11));
        assert_eq!(ring.push_bounded(13, 2).unwrap(), None);
        assert_eq!(ring.pop().unwrap(), Some(12));
        assert_eq!(ring.pop().unwrap(), Some(13));

        // a zero depth behaves like one
        assert_eq!(ring.push_bounded(14, 0).unwrap(), None);
        assert_eq!(ring.push_bounded(15, 0).unwrap(), Some(14));
    }

    #[test]
    fn test_push_fails_with_timeout_when_lock_held() {
        let ring: Box<Ring> = unsafe { zeroed() };
        ring.init("test.held");
        ring.lock_handle().lock(DEFAULT_LOCK_TIMEOUT).unwrap();

        assert!(matches!(ring.push(1), Err(Error::Timeout)));
        assert!(matches!(ring.push_bounded(1, 1), Err(Error::Timeout)));
        assert!(matches!(ring.pop(), Err(Error::Timeout)));
        assert_eq!(ring.size(), 0);

        ring.lock_handle().unlock().unwrap();
        ring.push(1).unwrap();
        assert_eq!(ring.size(), 1);
    }

    #[test]
    fn test_concurrent_pushes_are_not_lost() {
        let ring: Arc<Ring> = Arc::from(unsafe { zeroed::<Ring>() });
        ring.init("test.concurrent");

        // 4 threads x 8 pushes stays within NUM_DESC
        let handles: Vec<_> = (0..4u16)
            .map(|t| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..8u16 {
                        ring.push(t * 8 + i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(ring.size(), 32);
        let mut seen = Vec::new();
        while let Some(idx) = ring.pop().unwrap() {
            seen.push(idx);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<u16>>());
    }
}

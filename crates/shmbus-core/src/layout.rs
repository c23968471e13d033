//! Layout of the per-topic shared segment
//!
//! ```text
//! +--------------------------------------------+  offset 0
//! | header page: status, magic, version        |
//! +--------------------------------------------+  4096
//! | descs[NUM_DESC]                            |
//! +--------------------------------------------+
//! | avail ring  (one page)                     |
//! | free ring   (one page)                     |
//! | used[NUM_SUBSCRIBERS] rings (one page each)|
//! +--------------------------------------------+
//! | topic name page                            |
//! +--------------------------------------------+
//! ```
//!
//! No pointers anywhere, so the segment is valid at any mapped address.

use crate::meta::{read_name, write_name, Descriptor};
use crate::ring::Ring;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Number of descriptors, also the capacity of every ring. Must be a power of 2.
pub const NUM_DESC: usize = 32;

/// Number of subscriber slots per topic
pub const NUM_SUBSCRIBERS: usize = 32;

/// Maximum number of buffers in one message
pub const MAX_DATA_FRAMES: usize = 32;

/// Size of every fixed name field, including the NUL
pub const NAME_MAX: usize = 256;

const PAGE_SIZE: usize = 4096;

const MAGIC: u32 = 0x5348_4D42; // "SHMB"
const VERSION: u32 = 1;

/// Lifecycle of the whole segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MemoryStatus {
    Uninitialized = 0,
    Initialized = 1,
    Destroyed = 2,
    Corrupted = 3,
}

/// Lifecycle of one subscriber slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SlotStatus {
    Uninitialized = 0,
    Initialized = 1,
    Destroyed = 2,
    Corrupted = 3,
}

macro_rules! status_from_i32 {
    ($ty:ident) => {
        impl $ty {
            /// Convert from i32; unknown values read as corrupted
            pub fn from_i32(v: i32) -> Self {
                match v {
                    0 => $ty::Uninitialized,
                    1 => $ty::Initialized,
                    2 => $ty::Destroyed,
                    _ => $ty::Corrupted,
                }
            }
        }
    };
}

status_from_i32!(MemoryStatus);
status_from_i32!(SlotStatus);

/// One subscriber's private delivery channel: its used ring plus claim state
#[repr(transparent)]
pub struct SubscriberSlot {
    ring: Ring,
}

impl SubscriberSlot {
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Atomically claim the slot; true if this caller now owns it
    pub fn try_claim(&self) -> bool {
        self.ring
            .reserved
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Give the claim back so the slot can be reused
    pub fn unclaim(&self) {
        self.ring.reserved.store(0, Ordering::Release);
    }

    pub fn is_claimed(&self) -> bool {
        self.ring.reserved.load(Ordering::Acquire) != 0
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus::from_i32(self.ring.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SlotStatus) {
        self.ring.status.store(status as i32, Ordering::Release);
    }

    /// Record the owner's name and queue depth before announcing the slot
    pub(crate) fn announce(&self, name: &str, queue_depth: u32) {
        self.ring.set_name(name);
        self.ring.set_queue_depth(queue_depth);
        self.set_status(SlotStatus::Initialized);
    }
}

#[repr(C)]
struct Header {
    status: AtomicI32,
    magic: AtomicU32,
    version: AtomicU32,
    _reserved0: [u8; PAGE_SIZE - 12],
}

/// The whole shared segment of one topic
#[repr(C)]
pub struct RingMemory {
    header: Header,
    descs: [Descriptor; NUM_DESC],
    /// Indices ready to be published
    pub avail: Ring,
    /// Indices released by every subscriber, waiting for the publisher
    pub free: Ring,
    used: [SubscriberSlot; NUM_SUBSCRIBERS],
    name: UnsafeCell<[u8; NAME_MAX]>,
    _reserved1: [u8; PAGE_SIZE - NAME_MAX],
}

// Safety: `name` is written once by the publisher before status turns initialized.
unsafe impl Sync for RingMemory {}

impl RingMemory {
    /// Size of RingMemory in bytes, the exact size of every topic segment
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn status(&self) -> MemoryStatus {
        MemoryStatus::from_i32(self.header.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: MemoryStatus) {
        self.header.status.store(status as i32, Ordering::Release);
    }

    /// Stamp magic and version; done by the creator before `Initialized`
    pub(crate) fn stamp(&self) {
        self.header.magic.store(MAGIC, Ordering::Relaxed);
        self.header.version.store(VERSION, Ordering::Relaxed);
    }

    /// Check magic and version of an initialized segment
    pub fn validate(&self) -> Result<(), String> {
        let magic = self.header.magic.load(Ordering::Relaxed);
        if magic != MAGIC {
            return Err(format!("invalid magic number {magic:#x}"));
        }
        let version = self.header.version.load(Ordering::Relaxed);
        if version != VERSION {
            return Err(format!(
                "version mismatch: expected {VERSION}, got {version}"
            ));
        }
        Ok(())
    }

    /// Descriptor `idx`, `None` outside the table
    pub fn desc(&self, idx: u16) -> Option<&Descriptor> {
        self.descs.get(idx as usize)
    }

    pub fn descs(&self) -> &[Descriptor] {
        &self.descs
    }

    /// Subscriber slot `slot`, `None` outside the table
    pub fn slot(&self, slot: usize) -> Option<&SubscriberSlot> {
        self.used.get(slot)
    }

    pub fn slots(&self) -> &[SubscriberSlot] {
        &self.used
    }

    pub fn name(&self) -> String {
        read_name(unsafe { &*self.name.get() })
    }

    pub(crate) fn set_name(&self, name: &str) {
        write_name(unsafe { &mut *self.name.get() }, name);
    }

    /// Claim the first free subscriber slot
    pub fn claim_slot(&self) -> Option<(usize, &SubscriberSlot)> {
        self.used
            .iter()
            .enumerate()
            .find(|(_, slot)| slot.try_claim())
    }
}

const _: () = assert!(NUM_SUBSCRIBERS <= u16::MAX as usize);

/// Heap allocation with every byte zero, the state of a fresh segment
///
/// # Safety
/// `T` must be valid when all bytes are zero.
#[cfg(test)]
pub(crate) unsafe fn zeroed<T>() -> Box<T> {
    let layout = std::alloc::Layout::new::<T>();
    let ptr = std::alloc::alloc_zeroed(layout) as *mut T;
    if ptr.is_null() {
        std::alloc::handle_alloc_error(layout);
    }
    Box::from_raw(ptr)
}

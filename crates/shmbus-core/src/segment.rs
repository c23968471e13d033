//! Topic segment handle and the descriptor release protocol

use crate::layout::{RingMemory, NUM_DESC};
use crate::semaphore::NamedSemaphore;
use crate::shm::SharedMemory;
use crate::{Error, Result};

/// Segment name of a topic: every `/` becomes `_`
pub fn segment_name(topic: &str) -> String {
    topic.replace('/', "_")
}

/// Name of the semaphore signaling the free ring
pub fn free_sem_name(topic: &str) -> String {
    format!("{}_free", segment_name(topic))
}

/// Name of the semaphore signaling subscriber slot `slot`
pub fn used_sem_name(topic: &str, slot: usize) -> String {
    format!("{}_used{}", segment_name(topic), slot)
}

/// A mapped `RingMemory` segment of one topic.
///
/// Every operation on shared state goes through this handle; there is no
/// process-wide instance.
pub struct RingSegment {
    shm: SharedMemory,
    topic: String,
}

impl RingSegment {
    /// Create the zero-filled segment of `topic`; the caller becomes its owner
    pub fn create(topic: &str) -> Result<Self> {
        let shm = SharedMemory::create(&segment_name(topic), RingMemory::SIZE)?;
        Ok(Self {
            shm,
            topic: topic.to_string(),
        })
    }

    /// Map the existing segment of `topic`, checking its size
    pub fn open(topic: &str) -> Result<Self> {
        let shm = SharedMemory::open(&segment_name(topic))?;
        if shm.size() != RingMemory::SIZE {
            return Err(Error::SharedMemory(format!(
                "shared memory {} size is not correct: {} != {}",
                shm.name(),
                shm.size(),
                RingMemory::SIZE
            )));
        }
        Ok(Self {
            shm,
            topic: topic.to_string(),
        })
    }

    /// Remove a segment left behind by a dead owner; a missing segment is fine
    pub fn unlink(topic: &str) -> Result<()> {
        SharedMemory::unlink(&segment_name(topic))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn memory(&self) -> &RingMemory {
        // Safety: the mapping is page aligned and exactly RingMemory::SIZE bytes,
        // and RingMemory is valid for any byte content that only atomics mutate.
        unsafe { &*(self.shm.as_ptr() as *const RingMemory) }
    }
}

/// Outcome of dropping one reference on a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other holders remain
    Held(i32),
    /// Last reference: the index went back to the free ring
    Freed,
    /// More releases than references; nothing was done
    Underflow(i32),
}

/// Drop one reference on descriptor `idx`. The caller that takes the count to
/// zero pushes `idx` onto the free ring and posts `free_sem`.
pub fn release_desc(mem: &RingMemory, free_sem: &NamedSemaphore, idx: u16) -> Result<Release> {
    let desc = mem
        .desc(idx)
        .ok_or_else(|| Error::OutOfBound(format!("descriptor index {idx} >= {NUM_DESC}")))?;

    tracing::debug!(idx, "release desc");
    let remaining = desc.release();
    if remaining > 0 {
        return Ok(Release::Held(remaining));
    }
    if remaining < 0 {
        // no recovery: the count is left as is
        tracing::error!(idx, ref_count = remaining, "desc ref underflow");
        return Ok(Release::Underflow(remaining));
    }

    tracing::debug!(idx, "free desc");
    mem.free.push(idx).and_then(|_| free_sem.post()).map_err(|e| {
        tracing::error!(idx, error = %e, "failed to release desc");
        e
    })?;
    Ok(Release::Freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::zeroed;

    fn free_sem() -> NamedSemaphore {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "shmbus_segment_test_{}_{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        );
        NamedSemaphore::create(&name, 0).unwrap()
    }

    #[test]
    fn test_names_from_topic() {
        assert_eq!(segment_name("/sensor/camera/CAM0/raw"), "_sensor_camera_CAM0_raw");
        assert_eq!(free_sem_name("/cam"), "_cam_free");
        assert_eq!(used_sem_name("/cam", 3), "_cam_used3");
    }

    #[test]
    fn test_exactly_r_releases_free_the_index() {
        let mem: Box<RingMemory> = unsafe { zeroed() };
        mem.free.init("test.free");
        let sem = free_sem();
        mem.desc(4).unwrap().set_ref_count(3);

        assert_eq!(release_desc(&mem, &sem, 4).unwrap(), Release::Held(2));
        assert_eq!(release_desc(&mem, &sem, 4).unwrap(), Release::Held(1));
        assert!(mem.free.is_empty());
        assert_eq!(sem.value().unwrap(), 0);

        assert_eq!(release_desc(&mem, &sem, 4).unwrap(), Release::Freed);
        assert_eq!(sem.value().unwrap(), 1);
        assert_eq!(mem.free.pop().unwrap(), Some(4));

        // one release too many is reported, nothing is pushed
        assert_eq!(release_desc(&mem, &sem, 4).unwrap(), Release::Underflow(-1));
        assert!(mem.free.is_empty());
        assert_eq!(sem.value().unwrap(), 1);
    }

    #[test]
    fn test_release_out_of_table() {
        let mem: Box<RingMemory> = unsafe { zeroed() };
        let sem = free_sem();
        assert!(matches!(
            release_desc(&mem, &sem, NUM_DESC as u16),
            Err(Error::OutOfBound(_))
        ));
    }

    #[test]
    fn test_open_missing_segment_fails() {
        assert!(RingSegment::open("/shmbus/never/created").is_err());
        RingSegment::unlink("/shmbus/never/created").unwrap();
    }

    #[test]
    fn test_open_rejects_wrong_size() {
        let topic = format!("/shmbus/wrong_size/{}", std::process::id());
        let _shm = SharedMemory::create(&segment_name(&topic), 4096).unwrap();
        assert!(matches!(
            RingSegment::open(&topic),
            Err(Error::SharedMemory(_))
        ));
    }
}

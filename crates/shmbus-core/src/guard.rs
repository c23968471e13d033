//! RAII handles for received frames

use crate::buffer::MappedBuffer;
use crate::mapper::ImportedBuffer;
use crate::meta::{BufferRef, FrameInfo};
use crate::subscriber::Channel;
use std::ops::Range;
use std::sync::Arc;

/// Payload range `offset..offset + len` of `buf`, `None` if it does not fit in
/// `mapped_len` bytes
pub(crate) fn payload_range(buf: &BufferRef, mapped_len: usize) -> Option<Range<usize>> {
    let start = usize::try_from(buf.offset).ok()?;
    let end = start.checked_add(usize::try_from(buf.len).ok()?)?;
    (end <= mapped_len).then_some(start..end)
}

/// The subscriber's single reference on one descriptor.
///
/// Shared by every frame of the message; the last frame dropped gives the
/// reference back.
pub(crate) struct Lease {
    channel: Arc<Channel>,
    idx: u16,
}

impl Lease {
    pub(crate) fn new(channel: Arc<Channel>, idx: u16) -> Self {
        Self { channel, idx }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.channel.release(self.idx);
    }
}

/// RAII guard for one received frame.
///
/// Cloning shares the same message reference; the descriptor is returned to the
/// publisher once every guard of the message is gone.
#[derive(Clone)]
pub struct FrameGuard {
    buffer: Arc<ImportedBuffer>,
    buf: BufferRef,
    info: FrameInfo,
    lease: Arc<Lease>,
}

impl FrameGuard {
    pub(crate) fn new(
        buffer: Arc<ImportedBuffer>,
        buf: BufferRef,
        info: FrameInfo,
        lease: Arc<Lease>,
    ) -> Self {
        Self {
            buffer,
            buf,
            info,
            lease,
        }
    }

    /// Descriptor index this frame arrived in
    pub fn message_index(&self) -> u16 {
        self.lease.idx
    }

    /// Reference as published; may differ from the mapping's origin in
    /// per-message metadata such as image props
    pub fn buffer_ref(&self) -> &BufferRef {
        &self.buf
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn frame_id(&self) -> u64 {
        self.info.frame_id
    }

    pub fn timestamp(&self) -> u64 {
        self.info.timestamp
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The local mapping, shared with other frames on the same handle
    pub fn mapped(&self) -> &MappedBuffer {
        &self.buffer
    }

    /// Payload bytes of this frame: `offset..offset + len` of the mapped allocation.
    ///
    /// Empty if the published range does not fit the allocation; `receive`
    /// rejects such frames, so this only guards hand-built references.
    pub fn as_slice(&self) -> &[u8] {
        match payload_range(&self.buf, self.buffer.len()) {
            Some(range) => &self.buffer.as_slice()[range],
            None => &[],
        }
    }
}

impl std::fmt::Debug for FrameGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameGuard")
            .field("message_index", &self.lease.idx)
            .field("info", &self.info)
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// One received message: all frames published together
#[derive(Debug)]
pub struct Message {
    index: u16,
    timestamp: u64,
    frames: Vec<FrameGuard>,
}

impl Message {
    pub(crate) fn new(index: u16, timestamp: u64, frames: Vec<FrameGuard>) -> Self {
        Self {
            index,
            timestamp,
            frames,
        }
    }

    /// Descriptor index of the message
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Publish timestamp
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn frames(&self) -> &[FrameGuard] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<FrameGuard> {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Allocator;

    #[test]
    fn test_payload_range() {
        let mut buf = BufferRef::raw(Allocator::Shm, 1, 64);
        assert_eq!(payload_range(&buf, 64), Some(0..64));

        buf.offset = 16;
        buf.len = 16;
        assert_eq!(payload_range(&buf, 64), Some(16..32));

        buf.len = 49;
        assert_eq!(payload_range(&buf, 64), None);

        buf.offset = u64::MAX;
        buf.len = 2;
        assert_eq!(payload_range(&buf, 64), None);
    }
}

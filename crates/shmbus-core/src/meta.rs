//! Buffer references and descriptors stored in shared memory
//!
//! Everything here is `#[repr(C)]`, made of integers and fixed arrays only, and
//! valid when all bytes are zero, so the same bytes can be read at any mapped
//! address by any process.

use crate::dtype::TensorType;
use crate::layout::{MAX_DATA_FRAMES, NAME_MAX};
use crate::storage::{Allocator, BufferType, BufferUsage};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Maximum number of image planes
pub const MAX_IMAGE_PLANES: usize = 4;

/// Maximum number of tensor dimensions
pub const MAX_TENSOR_DIMS: usize = 8;

/// Image layout of a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ImageProps {
    pub format: u32,
    pub batch_size: u32,
    pub width: u32,
    pub height: u32,
    /// Stride along width in bytes, per plane
    pub stride: [u32; MAX_IMAGE_PLANES],
    /// Height in scanlines, per plane
    pub actual_height: [u32; MAX_IMAGE_PLANES],
    /// `stride * actual_height + padding`, per plane
    pub plane_buf_size: [u32; MAX_IMAGE_PLANES],
    pub num_planes: u32,
}

/// Tensor shape of a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TensorProps {
    pub tensor_type: u32,
    pub dims: [u32; MAX_TENSOR_DIMS],
    pub num_dims: u32,
}

impl TensorProps {
    pub fn new(tensor_type: TensorType, dims: &[u32]) -> Self {
        let mut props = Self {
            tensor_type: tensor_type as u32,
            ..Default::default()
        };
        let n = dims.len().min(MAX_TENSOR_DIMS);
        props.dims[..n].copy_from_slice(&dims[..n]);
        props.num_dims = n as u32;
        props
    }

    pub fn tensor_type(&self) -> Option<TensorType> {
        TensorType::from_u32(self.tensor_type)
    }

    pub fn dims(&self) -> &[u32] {
        &self.dims[..(self.num_dims as usize).min(MAX_TENSOR_DIMS)]
    }
}

/// Process-portable description of a hardware buffer.
///
/// Holds the allocator handle and attributes, never an address: the receiving
/// process imports the handle through a `MemoryMapper`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BufferRef {
    /// DMA / shared-memory handle, opaque outside its allocator
    pub dma_handle: u64,
    /// Size of the whole allocation
    pub size: u64,
    /// Offset of the payload inside the allocation
    pub offset: u64,
    /// Payload length
    pub len: u64,
    /// Id assigned by the allocator
    pub id: u64,
    /// Process that owns the allocation
    pub pid: u64,
    pub usage: u32,
    pub flags: u32,
    pub allocator: u32,
    pub buffer_type: u32,
    pub image: ImageProps,
    pub tensor: TensorProps,
}

impl BufferRef {
    /// A raw buffer covering the whole allocation
    pub fn raw(allocator: Allocator, dma_handle: u64, size: u64) -> Self {
        Self {
            dma_handle,
            size,
            len: size,
            pid: std::process::id() as u64,
            allocator: allocator as u32,
            buffer_type: BufferType::Raw as u32,
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: ImageProps) -> Self {
        self.buffer_type = BufferType::Image as u32;
        self.image = image;
        self
    }

    pub fn with_tensor(mut self, tensor: TensorProps) -> Self {
        self.buffer_type = BufferType::Tensor as u32;
        self.tensor = tensor;
        self
    }

    pub fn with_usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage as u32;
        self
    }

    pub fn buffer_type(&self) -> Option<BufferType> {
        BufferType::from_u32(self.buffer_type)
    }

    pub fn usage(&self) -> Option<BufferUsage> {
        BufferUsage::from_u32(self.usage)
    }

    pub fn allocator(&self) -> Option<Allocator> {
        Allocator::from_u32(self.allocator)
    }
}

/// Per-frame metadata travelling next to a buffer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameInfo {
    pub frame_id: u64,
    pub timestamp: u64,
    /// Tensor quantization scale
    pub quant_scale: f32,
    /// Tensor quantization offset
    pub quant_offset: i32,
    pub name: String,
}

/// One frame slot inside a `Descriptor`
#[derive(Clone, Copy)]
#[repr(C)]
pub struct FrameEntry {
    pub buf: BufferRef,
    pub frame_id: u64,
    pub timestamp: u64,
    pub quant_scale: f32,
    pub quant_offset: i32,
    name: [u8; NAME_MAX],
}

impl FrameEntry {
    pub fn new(buf: BufferRef, info: &FrameInfo) -> Self {
        let mut entry = Self {
            buf,
            frame_id: info.frame_id,
            timestamp: info.timestamp,
            quant_scale: info.quant_scale,
            quant_offset: info.quant_offset,
            name: [0u8; NAME_MAX],
        };
        write_name(&mut entry.name, &info.name);
        entry
    }

    pub fn name(&self) -> String {
        read_name(&self.name)
    }

    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            frame_id: self.frame_id,
            timestamp: self.timestamp,
            quant_scale: self.quant_scale,
            quant_offset: self.quant_offset,
            name: self.name(),
        }
    }
}

impl fmt::Debug for FrameEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameEntry")
            .field("name", &self.name())
            .field("frame_id", &self.frame_id)
            .field("timestamp", &self.timestamp)
            .field("quant_scale", &self.quant_scale)
            .field("quant_offset", &self.quant_offset)
            .field("buf", &self.buf)
            .finish()
    }
}

/// One published message: up to `MAX_DATA_FRAMES` buffers plus the reference count
/// that decides when its index goes back to the free ring.
#[repr(C)]
pub struct Descriptor {
    frames: UnsafeCell<[FrameEntry; MAX_DATA_FRAMES]>,
    timestamp: AtomicU64,
    num_frames: AtomicU32,
    /// Number of subscribers still holding this message
    ref_count: AtomicI32,
}

// Safety: frames are only written by the publisher while it owns the index
// (popped from `avail`, not yet pushed to any used ring); the ring spinlock
// orders those writes before any subscriber reads them.
unsafe impl Sync for Descriptor {}

impl Descriptor {
    /// Size of Descriptor in bytes
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Number of valid frames, clamped to the table size
    pub fn num_frames(&self) -> usize {
        (self.num_frames.load(Ordering::Acquire) as usize).min(MAX_DATA_FRAMES)
    }

    /// Copy out frame `i`
    pub fn frame(&self, i: usize) -> Option<FrameEntry> {
        if i >= self.num_frames() {
            return None;
        }
        Some(unsafe { (*self.frames.get())[i] })
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Take one more reference, returns the new count
    pub fn add_ref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference, returns the new count (negative on underflow)
    pub fn release(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn set_ref_count(&self, count: i32) {
        self.ref_count.store(count, Ordering::Release);
    }

    /// Fill the descriptor with a new message.
    ///
    /// # Safety
    /// The caller must own the index: no subscriber may be reading this descriptor.
    pub(crate) unsafe fn fill(&self, frames: &[FrameEntry], timestamp: u64) {
        let n = frames.len().min(MAX_DATA_FRAMES);
        let table = &mut *self.frames.get();
        table[..n].copy_from_slice(&frames[..n]);
        self.num_frames.store(n as u32, Ordering::Release);
        self.timestamp.store(timestamp, Ordering::Release);
    }
}

/// Copy `s` into a NUL-terminated fixed buffer, truncating on a char boundary
pub(crate) fn write_name(dst: &mut [u8], s: &str) {
    let mut n = s.len().min(dst.len().saturating_sub(1));
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
    dst[n..].fill(0);
}

pub(crate) fn read_name(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

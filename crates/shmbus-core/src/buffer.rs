//! Buffers: mapped views and the shared-memory backend

use crate::meta::BufferRef;
use crate::shm::SharedMemory;
use crate::storage::Allocator;
use crate::{Error, Result};
use std::any::Any;
use std::fmt;
use std::ptr::NonNull;

/// A buffer imported into this process's address space.
///
/// `backing` keeps whatever the mapper needs alive for as long as the address
/// is in use; dropping it releases the mapping.
pub struct MappedBuffer {
    origin: BufferRef,
    ptr: NonNull<u8>,
    len: usize,
    backing: Option<Box<dyn Any + Send + Sync>>,
}

// Safety: the mapping is process-wide and immutable for the lifetime of this value.
unsafe impl Send for MappedBuffer {}
unsafe impl Sync for MappedBuffer {}

impl MappedBuffer {
    /// Wrap a mapped range.
    ///
    /// # Safety
    /// `ptr..ptr+len` must stay mapped and readable until `backing` is dropped,
    /// or for the whole process lifetime if `backing` is `None`.
    pub unsafe fn new(
        origin: BufferRef,
        ptr: *mut u8,
        len: usize,
        backing: Option<Box<dyn Any + Send + Sync>>,
    ) -> Result<Self> {
        let ptr = NonNull::new(ptr).ok_or(Error::NullPtr)?;
        Ok(Self {
            origin,
            ptr,
            len,
            backing,
        })
    }

    /// The reference this mapping was imported from
    pub fn origin(&self) -> &BufferRef {
        &self.origin
    }

    pub fn dma_handle(&self) -> u64 {
        self.origin.dma_handle
    }

    /// Local address of the payload
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Release the mapping now
    pub fn into_backing(self) -> Option<Box<dyn Any + Send + Sync>> {
        self.backing
    }
}

impl fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("dma_handle", &self.origin.dma_handle)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Name of the shm object backing handle `handle` of `pool`
pub fn shm_buffer_name(pool: &str, handle: u64) -> String {
    format!("{}_buf_{}", pool.replace('/', "_"), handle)
}

/// Buffer allocated as its own POSIX shared memory object.
///
/// The allocating process owns the object; it disappears when this value is dropped,
/// so a publisher keeps it alive until every subscriber released the message.
pub struct ShmBuffer {
    shm: SharedMemory,
    buf: BufferRef,
}

impl ShmBuffer {
    /// Allocate `size` zeroed bytes under `handle`
    pub fn alloc(pool: &str, handle: u64, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::BadArguments("zero sized buffer".to_string()));
        }
        let shm = SharedMemory::create(&shm_buffer_name(pool, handle), size)?;
        let buf = BufferRef::raw(Allocator::Shm, handle, size as u64);
        Ok(Self { shm, buf })
    }

    /// The portable reference to hand to subscribers
    pub fn buffer_ref(&self) -> BufferRef {
        self.buf
    }

    /// Replace the reference metadata (image/tensor props, usage); handle and size are kept
    pub fn describe(&mut self, f: impl FnOnce(BufferRef) -> BufferRef) {
        let (handle, size, allocator) = (self.buf.dma_handle, self.buf.size, self.buf.allocator);
        let mut buf = f(self.buf);
        buf.dma_handle = handle;
        buf.size = size;
        buf.allocator = allocator;
        self.buf = buf;
    }

    pub fn as_slice(&self) -> &[u8] {
        self.shm.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.shm.as_mut_slice()
    }
}

//! Importing buffer references into the local address space
//!
//! The subscriber never interprets a `BufferRef` handle itself; a
//! `MemoryMapper` for the buffer's allocator does. DMA-BUF or PMEM backends plug
//! in by implementing the trait.

use crate::buffer::{shm_buffer_name, MappedBuffer};
use crate::meta::BufferRef;
use crate::shm::SharedMemory;
use crate::storage::Allocator;
use crate::{Error, Result};
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::Arc;

/// Maps remote-process buffer handles into this process
pub trait MemoryMapper: Send + Sync + 'static {
    /// Import the whole allocation of `origin` (`origin.size` bytes); the result
    /// stays valid until passed to `unmap`
    fn map(&self, origin: &BufferRef) -> Result<MappedBuffer>;

    /// Reverse `map`
    fn unmap(&self, mapped: MappedBuffer) -> Result<()>;
}

/// A mapping owned by the subscriber's cache and its frames.
///
/// Dropping the last handle passes the mapping back to the mapper that made it.
pub struct ImportedBuffer {
    mapped: ManuallyDrop<MappedBuffer>,
    mapper: Arc<dyn MemoryMapper>,
}

impl ImportedBuffer {
    pub(crate) fn new(mapped: MappedBuffer, mapper: Arc<dyn MemoryMapper>) -> Self {
        Self {
            mapped: ManuallyDrop::new(mapped),
            mapper,
        }
    }

    /// Unmap now and report the mapper's result
    pub(crate) fn unmap(self) -> Result<()> {
        let mut this = ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so both fields are moved out exactly once.
        let (mapped, mapper) = unsafe {
            (
                ManuallyDrop::take(&mut this.mapped),
                std::ptr::read(&this.mapper),
            )
        };
        mapper.unmap(mapped)
    }
}

impl Deref for ImportedBuffer {
    type Target = MappedBuffer;

    fn deref(&self) -> &MappedBuffer {
        &self.mapped
    }
}

impl Drop for ImportedBuffer {
    fn drop(&mut self) {
        // Safety: `mapped` is not touched again after drop.
        let mapped = unsafe { ManuallyDrop::take(&mut self.mapped) };
        let handle = mapped.dma_handle();
        if let Err(e) = self.mapper.unmap(mapped) {
            tracing::error!(handle, error = %e, "failed to unmap buffer");
        }
    }
}

impl std::fmt::Debug for ImportedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.mapped, f)
    }
}

/// Mapper for buffers allocated with `ShmBuffer`
#[derive(Debug, Clone)]
pub struct ShmMapper {
    pool: String,
}

impl ShmMapper {
    /// Mapper for buffers allocated in `pool`
    pub fn new(pool: &str) -> Self {
        Self {
            pool: pool.to_string(),
        }
    }
}

impl MemoryMapper for ShmMapper {
    fn map(&self, origin: &BufferRef) -> Result<MappedBuffer> {
        if origin.allocator() != Some(Allocator::Shm) {
            return Err(Error::BadArguments(format!(
                "buffer {} is not a shm buffer (allocator {})",
                origin.dma_handle, origin.allocator
            )));
        }

        let mut shm = SharedMemory::open(&shm_buffer_name(&self.pool, origin.dma_handle))?;
        if origin.size > shm.size() as u64 {
            return Err(Error::OutOfBound(format!(
                "buffer {} of {} bytes exceeds mapping of {} bytes",
                origin.dma_handle,
                origin.size,
                shm.size()
            )));
        }

        // the whole allocation; frames on this handle pick their own offset and len
        let ptr = shm.as_mut_ptr();
        tracing::debug!(handle = origin.dma_handle, size = origin.size, "mapped shm buffer");
        // Safety: `size` was checked against the mapping, which lives in `backing`.
        unsafe { MappedBuffer::new(*origin, ptr, origin.size as usize, Some(Box::new(shm))) }
    }

    fn unmap(&self, mapped: MappedBuffer) -> Result<()> {
        let handle = mapped.dma_handle();
        let backing = mapped.into_backing().ok_or(Error::NullPtr)?;
        backing
            .downcast::<SharedMemory>()
            .map_err(|_| Error::Fail(format!("buffer {handle} was not mapped by this mapper")))?;
        tracing::debug!(handle, "unmapped shm buffer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ShmBuffer;

    fn pool() -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "shmbus_mapper_test_{}_{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_map_reads_publisher_bytes() {
        let pool = pool();
        let mut buf = ShmBuffer::alloc(&pool, 9, 64).unwrap();
        buf.as_mut_slice()[..4].copy_from_slice(b"data");

        let mapper = ShmMapper::new(&pool);
        let mapped = mapper.map(&buf.buffer_ref()).unwrap();
        assert_eq!(mapped.len(), 64);
        assert_eq!(&mapped.as_slice()[..4], b"data");

        // writes after mapping are visible, no copy was made
        buf.as_mut_slice()[0] = b'D';
        assert_eq!(mapped.as_slice()[0], b'D');
        mapper.unmap(mapped).unwrap();
    }

    #[test]
    fn test_map_unmap_remap() {
        let pool = pool();
        let buf = ShmBuffer::alloc(&pool, 1, 128).unwrap();
        let mapper = ShmMapper::new(&pool);

        let first = mapper.map(&buf.buffer_ref()).unwrap();
        mapper.unmap(first).unwrap();
        let second = mapper.map(&buf.buffer_ref()).unwrap();
        assert_eq!(second.len(), 128);
        assert_eq!(second.dma_handle(), 1);
    }

    #[test]
    fn test_imported_buffer_unmaps_through_mapper() {
        let pool = pool();
        let buf = ShmBuffer::alloc(&pool, 4, 32).unwrap();
        let mapper: Arc<dyn MemoryMapper> = Arc::new(ShmMapper::new(&pool));

        let imported = ImportedBuffer::new(mapper.map(&buf.buffer_ref()).unwrap(), mapper.clone());
        assert_eq!(imported.len(), 32);
        imported.unmap().unwrap();

        // dropping unmaps as well; the mapper is the last owner afterwards
        let imported = ImportedBuffer::new(mapper.map(&buf.buffer_ref()).unwrap(), mapper.clone());
        assert_eq!(Arc::strong_count(&mapper), 2);
        drop(imported);
        assert_eq!(Arc::strong_count(&mapper), 1);
    }

    #[test]
    fn test_map_missing_or_foreign_buffer_fails() {
        let mapper = ShmMapper::new(&pool());
        let missing = BufferRef::raw(Allocator::Shm, 404, 16);
        assert!(mapper.map(&missing).is_err());

        let foreign = BufferRef::raw(Allocator::DmaBuf, 1, 16);
        assert!(matches!(mapper.map(&foreign), Err(Error::BadArguments(_))));
    }

    #[test]
    fn test_map_covers_whole_allocation() {
        let pool = pool();
        let mut buf = ShmBuffer::alloc(&pool, 3, 64).unwrap();
        buf.as_mut_slice()[16] = 0xab;

        // offset and len of the first reference do not narrow the mapping
        let mut r = buf.buffer_ref();
        r.offset = 16;
        r.len = 16;
        let mapped = ShmMapper::new(&pool).map(&r).unwrap();
        assert_eq!(mapped.len(), 64);
        assert_eq!(mapped.as_slice()[16], 0xab);
    }

    #[test]
    fn test_map_rejects_size_past_end() {
        let pool = pool();
        let buf = ShmBuffer::alloc(&pool, 2, 32).unwrap();
        let mut r = buf.buffer_ref();
        r.size = 4096;
        assert!(matches!(
            ShmMapper::new(&pool).map(&r),
            Err(Error::OutOfBound(_))
        ));
    }
}

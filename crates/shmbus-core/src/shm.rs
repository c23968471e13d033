//! POSIX shared memory wrapper

use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf};
use std::ffi::CString;

/// OS-level name for an object: exactly one leading `/`
pub(crate) fn os_name(name: &str) -> String {
    format!("/{}", name.trim_start_matches('/'))
}

/// Shared memory region wrapper
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
    owner: bool,
}

// Safety: the mapping is process-wide; all concurrent access to its contents goes
// through atomics or the in-segment spinlocks.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new zero-filled region. Fails if `name` already exists.
    ///
    /// The creator owns the name: it is unlinked when this handle is dropped.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(os_name(name))
            .create()
            .map_err(|e| Error::SharedMemory(format!("create {name}: {e}")))?;

        let mut shm = Self {
            inner: shmem,
            name: name.to_string(),
            size,
            owner: true,
        };
        shm.as_mut_slice().fill(0);
        Ok(shm)
    }

    /// Open an existing shared memory region
    pub fn open(name: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(os_name(name))
            .open()
            .map_err(|e| Error::SharedMemory(format!("open {name}: {e}")))?;

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
            owner: false,
        })
    }

    /// Remove `name` from the namespace; existing mappings stay valid. A missing
    /// name is not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c = CString::new(os_name(name))
            .map_err(|_| Error::BadArguments(format!("shm name {name:?} contains NUL")))?;
        if unsafe { libc::shm_unlink(c.as_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::SharedMemory(format!("unlink {name}: {err}")));
            }
        }
        Ok(())
    }

    /// Get the name of the shared memory region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of the shared memory region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether dropping this handle unlinks the name
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Get a raw pointer to the shared memory
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    /// Get a mutable raw pointer to the shared memory
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.inner.as_ptr() as *mut u8
    }

    /// Get a slice view of the shared memory
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size) }
    }

    /// Get a mutable slice view of the shared memory
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.size) }
    }
}

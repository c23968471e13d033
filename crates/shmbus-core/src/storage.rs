//! Buffer kind, usage and allocator definitions

/// What a buffer carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BufferType {
    Raw = 0,
    Image = 1,
    Tensor = 2,
}

impl BufferType {
    /// Convert from u32
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(BufferType::Raw),
            1 => Some(BufferType::Image),
            2 => Some(BufferType::Tensor),
            _ => None,
        }
    }
}

/// Hardware block the buffer was allocated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BufferUsage {
    Default = 0,
    Camera = 1,
    Gpu = 2,
    Vpu = 3,
    Eva = 4,
    Htp = 5,
}

impl BufferUsage {
    /// Convert from u32
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(BufferUsage::Default),
            1 => Some(BufferUsage::Camera),
            2 => Some(BufferUsage::Gpu),
            3 => Some(BufferUsage::Vpu),
            4 => Some(BufferUsage::Eva),
            5 => Some(BufferUsage::Htp),
            _ => None,
        }
    }
}

/// Allocator that produced the handle; selects the mapper able to import it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Allocator {
    Heap = 0,
    DmaBuf = 1,
    Pmem = 2,
    Shm = 3,
}

impl Allocator {
    /// Convert from u32
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Allocator::Heap),
            1 => Some(Allocator::DmaBuf),
            2 => Some(Allocator::Pmem),
            3 => Some(Allocator::Shm),
            _ => None,
        }
    }
}

/// Uncached memory (default)
pub const BUFFER_FLAGS_CACHE_NONE: u32 = 0x0;
/// Write-back, write-allocate memory, for blocks coherent with the CPU cache
pub const BUFFER_FLAGS_CACHE_WB_WA: u32 = 0x1;
pub const BUFFER_FLAGS_CACHE_MASK: u32 = 0xF;

//! Tensor element type definitions

/// Tensor element types carried in a `TensorProps`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TensorType {
    Int8 = 0,
    Int16 = 1,
    Int32 = 2,
    Int64 = 3,
    UInt8 = 4,
    UInt16 = 5,
    UInt32 = 6,
    UInt64 = 7,
    Float16 = 8,
    Float32 = 9,
    Float64 = 10,
    SFixedPoint8 = 11,
    SFixedPoint16 = 12,
    SFixedPoint32 = 13,
    UFixedPoint8 = 14,
    UFixedPoint16 = 15,
    UFixedPoint32 = 16,
}

impl TensorType {
    /// Size in bytes
    pub const fn size(&self) -> usize {
        match self {
            TensorType::Int8
            | TensorType::UInt8
            | TensorType::SFixedPoint8
            | TensorType::UFixedPoint8 => 1,
            TensorType::Int16
            | TensorType::UInt16
            | TensorType::Float16
            | TensorType::SFixedPoint16
            | TensorType::UFixedPoint16 => 2,
            TensorType::Int32
            | TensorType::UInt32
            | TensorType::Float32
            | TensorType::SFixedPoint32
            | TensorType::UFixedPoint32 => 4,
            TensorType::Int64 | TensorType::UInt64 | TensorType::Float64 => 8,
        }
    }

    /// Whether values need `quant_scale`/`quant_offset` to be interpreted
    pub const fn is_quantized(&self) -> bool {
        matches!(
            self,
            TensorType::SFixedPoint8
                | TensorType::SFixedPoint16
                | TensorType::SFixedPoint32
                | TensorType::UFixedPoint8
                | TensorType::UFixedPoint16
                | TensorType::UFixedPoint32
        )
    }

    /// Convert from the raw value stored in shared memory
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(TensorType::Int8),
            1 => Some(TensorType::Int16),
            2 => Some(TensorType::Int32),
            3 => Some(TensorType::Int64),
            4 => Some(TensorType::UInt8),
            5 => Some(TensorType::UInt16),
            6 => Some(TensorType::UInt32),
            7 => Some(TensorType::UInt64),
            8 => Some(TensorType::Float16),
            9 => Some(TensorType::Float32),
            10 => Some(TensorType::Float64),
            11 => Some(TensorType::SFixedPoint8),
            12 => Some(TensorType::SFixedPoint16),
            13 => Some(TensorType::SFixedPoint32),
            14 => Some(TensorType::UFixedPoint8),
            15 => Some(TensorType::UFixedPoint16),
            16 => Some(TensorType::UFixedPoint32),
            _ => None,
        }
    }
}

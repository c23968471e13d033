//! Error types for shmbus

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A semaphore wait, lock acquisition or segment wait exceeded its bound.
    #[error("operation timed out")]
    Timeout,

    #[error("bad state: {0}")]
    BadState(&'static str),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// Ring popped while its peer was signaled, or index outside the descriptor table.
    #[error("out of bound: {0}")]
    OutOfBound(String),

    #[error("operation failed: {0}")]
    Fail(String),

    #[error("unexpected null pointer")]
    NullPtr,

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("semaphore {name} failed: errno {errno}")]
    Semaphore { name: String, errno: i32 },

    #[error("no free subscriber slot")]
    NoFreeSlot,
}

impl Error {
    /// Whether the caller may simply retry the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;
use v86_cpu::BackendError;
use v86_mem::{AllocError, MemoryError};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("scratch buffer: {0}")]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("VBE Info Block task needs at least 512 bytes, got {len}")]
    InfoBlockTooSmall { len: usize },
}

impl TaskError {
    /// Scratch memory ran out; the engine itself is still healthy.
    pub fn is_exhausted(&self) -> bool {
        match self {
            TaskError::Alloc(err) => err.is_exhausted(),
            TaskError::Backend(BackendError::Alloc(err)) => err.is_exhausted(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;

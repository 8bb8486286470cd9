use std::io;

use thiserror::Error;
use v86_mem::{AllocError, MapError, MemoryError};

use crate::BackendKind;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{backend} backend is not available: {reason}")]
    Unsupported {
        backend: BackendKind,
        reason: &'static str,
    },

    #[error("failed to obtain I/O port privilege: {0}")]
    Privilege(#[source] io::Error),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("invalid opcode at {cs:04x}:{ip:04x}")]
    InvalidOpcode { cs: u16, ip: u32 },

    #[error("unsupported instruction `{mnemonic}` at {cs:04x}:{ip:04x}")]
    UnsupportedInstruction {
        cs: u16,
        ip: u32,
        mnemonic: String,
    },

    #[error("BIOS call did not return within {steps} instructions")]
    StepLimit { steps: u64 },

    #[error("BIOS code halted at {cs:04x}:{ip:04x}")]
    UnexpectedHalt { cs: u16, ip: u32 },

    #[error("virtual-8086 execution failed: {0}")]
    Trap(String),

    #[error("LRMI call for interrupt {vector:#04x} failed")]
    Library { vector: u8 },
}

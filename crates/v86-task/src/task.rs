//! Tasks and their little-endian wire format.
//!
//! A task is a fixed 60-byte header followed by exactly `buf_len` payload
//! bytes:
//!
//! ```text
//! flags u32, buf_len u32,
//! eax, ebx, ecx, edx, esi, edi, ebp, esp, eip, eflags: u32,
//! cs, ds, es, fs, gs, ss: u16,
//! payload[buf_len]
//! ```

use bitflags::bitflags;
use thiserror::Error;
use v86_cpu::CpuState;

pub const HEADER_LEN: usize = 60;

/// Largest payload a task can carry; header and payload together must fit
/// the 16-bit length field of an envelope.
pub const MAX_BUFFER_LEN: usize = u16::MAX as usize - HEADER_LEN;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct TaskFlags: u32 {
        /// The buffer is a VBE Info Block; ES:DI is always set, and the
        /// pointers in the result are relocated.
        const VBE_INFO_BLOCK = 1 << 0;
        /// Point ES:DI at the buffer.
        const BUF_ES_DI = 1 << 1;
        /// Point ES:BX at the buffer.
        const BUF_ES_BX = 1 << 2;
        /// Copy the buffer back after a successful call.
        const BUF_RETURN = 1 << 3;
        /// Stop the engine; nothing is executed.
        const EXIT = 1 << 4;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("task truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("{extra} trailing bytes after task payload")]
    TrailingBytes { extra: usize },

    #[error("task buffer of {len} bytes is too large")]
    Oversized { len: usize },

    #[error("unknown task flags {bits:#x}")]
    UnknownFlags { bits: u32 },
}

/// One BIOS call: the register file to load, an optional buffer placed in
/// real-mode memory for the call, and flags saying how to pass it.
///
/// After [`Engine::run`](crate::Engine::run) the registers and buffer hold
/// the post-call state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Task {
    pub flags: TaskFlags,
    pub regs: CpuState,
    pub buf: Vec<u8>,
}

impl Task {
    pub fn new(flags: TaskFlags, regs: CpuState, buf: Vec<u8>) -> Self {
        Self { flags, regs, buf }
    }

    /// The task that asks a server to shut down.
    pub fn exit() -> Self {
        Self {
            flags: TaskFlags::EXIT,
            ..Default::default()
        }
    }

    pub fn is_exit(&self) -> bool {
        self.flags.contains(TaskFlags::EXIT)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.buf.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        if self.buf.len() > MAX_BUFFER_LEN {
            return Err(WireError::Oversized {
                len: self.buf.len(),
            });
        }
        let r = &self.regs;
        push_u32(out, self.flags.bits());
        push_u32(out, self.buf.len() as u32);
        for v in [
            r.eax, r.ebx, r.ecx, r.edx, r.esi, r.edi, r.ebp, r.esp, r.eip, r.eflags,
        ] {
            push_u32(out, v);
        }
        for v in [r.cs, r.ds, r.es, r.fs, r.gs, r.ss] {
            push_u16(out, v);
        }
        out.extend_from_slice(&self.buf);
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(bytes);
        let bits = r.read_u32()?;
        let flags = TaskFlags::from_bits(bits).ok_or(WireError::UnknownFlags { bits })?;
        let len = r.read_u32()? as usize;
        if len > MAX_BUFFER_LEN {
            return Err(WireError::Oversized { len });
        }
        let regs = CpuState {
            eax: r.read_u32()?,
            ebx: r.read_u32()?,
            ecx: r.read_u32()?,
            edx: r.read_u32()?,
            esi: r.read_u32()?,
            edi: r.read_u32()?,
            ebp: r.read_u32()?,
            esp: r.read_u32()?,
            eip: r.read_u32()?,
            eflags: r.read_u32()?,
            cs: r.read_u16()?,
            ds: r.read_u16()?,
            es: r.read_u16()?,
            fs: r.read_u16()?,
            gs: r.read_u16()?,
            ss: r.read_u16()?,
        };
        let buf = r.read_bytes(len)?.to_vec();
        if r.remaining() != 0 {
            return Err(WireError::TrailingBytes {
                extra: r.remaining(),
            });
        }
        Ok(Self { flags, regs, buf })
    }
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated {
                needed: self.pos + len,
                got: self.bytes.len(),
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }
}

//! Rewrites the far pointers of a returned VBE Info Block into offsets
//! relative to the caller's buffer.
//!
//! The BIOS fills the 512-byte Info Block with `segment:offset` pointers
//! that either point back into the block itself or into ROM. Neither is
//! meaningful to a caller that only receives the buffer, so each pointer is
//! turned into a byte offset into that buffer. Data living in ROM is copied
//! into the part of the buffer past the first 512 bytes, as far as it fits.
//! A pointer that can be neither resolved nor copied becomes 0.

use tracing::trace;
use v86_mem::{RealModeAddress, RealModeMemory};

use crate::vbe::{INFO_BLOCK_LEN, VBE_MODE_LIST_END};

/// Data above this address is ROM or video memory and gets copied.
pub const COPY_THRESHOLD: u32 = 0xA0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerField {
    ModeList,
    OemString,
    OemVendorName,
    OemProductName,
    OemProductRev,
}

impl PointerField {
    /// Fields in the order they are relocated.
    pub const ORDER: [PointerField; 5] = [
        PointerField::ModeList,
        PointerField::OemString,
        PointerField::OemVendorName,
        PointerField::OemProductName,
        PointerField::OemProductRev,
    ];

    /// Byte offset of the field inside the Info Block.
    pub const fn offset(self) -> usize {
        match self {
            PointerField::OemString => 6,
            PointerField::ModeList => 14,
            PointerField::OemVendorName => 22,
            PointerField::OemProductName => 26,
            PointerField::OemProductRev => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The data was already inside the block.
    InBuffer { offset: u32 },
    /// The data was copied into the buffer tail; `len` includes the
    /// terminator.
    Copied { offset: u32, len: u32 },
    /// The field was zeroed.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub field: PointerField,
    /// The far pointer the BIOS returned.
    pub original: u32,
    pub outcome: Outcome,
}

/// Relocates the pointer fields of the Info Block in `buf`.
///
/// `block` is where the buffer lived in real-mode memory during the call and
/// `memory` is read to copy out-of-block data. Buffers too short to hold the
/// pointer fields are left alone.
pub fn relocate(
    buf: &mut [u8],
    block: RealModeAddress,
    memory: &dyn RealModeMemory,
) -> Vec<Relocation> {
    let fields_end = PointerField::OemProductRev.offset() + 4;
    if buf.len() < fields_end {
        return Vec::new();
    }

    let window = buf.len().min(INFO_BLOCK_LEN) as u32;
    let mut tail = Tail {
        cursor: INFO_BLOCK_LEN,
        end: buf.len(),
    };

    PointerField::ORDER
        .iter()
        .map(|&field| {
            let at = field.offset();
            let original = read_u32(buf, at);
            let outcome = match RealModeAddress::from_far_ptr(original) {
                Ok(target) => match target.offset_from(block) {
                    Some(offset) if offset < window => Outcome::InBuffer { offset },
                    _ if target.linear() > COPY_THRESHOLD => {
                        tail.copy(buf, field, target, memory)
                    }
                    _ => Outcome::Absent,
                },
                Err(_) => Outcome::Absent,
            };

            let value = match outcome {
                Outcome::InBuffer { offset } | Outcome::Copied { offset, .. } => offset,
                Outcome::Absent => 0,
            };
            buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
            trace!(?field, original, ?outcome, "relocated pointer");
            Relocation {
                field,
                original,
                outcome,
            }
        })
        .collect()
}

/// Free space past the Info Block proper.
struct Tail {
    cursor: usize,
    end: usize,
}

impl Tail {
    fn remaining(&self) -> usize {
        self.end.saturating_sub(self.cursor)
    }

    fn copy(
        &mut self,
        buf: &mut [u8],
        field: PointerField,
        source: RealModeAddress,
        memory: &dyn RealModeMemory,
    ) -> Outcome {
        let start = self.cursor;
        let written = match field {
            PointerField::ModeList => self.copy_mode_list(buf, source, memory),
            _ => self.copy_string(buf, source, memory),
        };
        match written {
            Some(len) => {
                self.cursor += len;
                Outcome::Copied {
                    offset: start as u32,
                    len: len as u32,
                }
            }
            None => Outcome::Absent,
        }
    }

    /// Copies 16-bit mode numbers up to and including the 0xFFFF
    /// terminator, truncating so the terminator always fits.
    fn copy_mode_list(
        &self,
        buf: &mut [u8],
        source: RealModeAddress,
        memory: &dyn RealModeMemory,
    ) -> Option<usize> {
        if self.remaining() < 2 {
            return None;
        }
        let mut at = self.cursor;
        let mut src = source;
        while self.end - at >= 4 {
            let Ok(mode) = memory.read_u16(src) else {
                break;
            };
            if mode == VBE_MODE_LIST_END {
                break;
            }
            buf[at..at + 2].copy_from_slice(&mode.to_le_bytes());
            at += 2;
            match src.checked_add(2) {
                Some(next) => src = next,
                None => break,
            }
        }
        buf[at..at + 2].copy_from_slice(&VBE_MODE_LIST_END.to_le_bytes());
        Some(at + 2 - self.cursor)
    }

    /// Copies a NUL-terminated string, truncating so the NUL always fits.
    fn copy_string(
        &self,
        buf: &mut [u8],
        source: RealModeAddress,
        memory: &dyn RealModeMemory,
    ) -> Option<usize> {
        if self.remaining() == 0 {
            return None;
        }
        // An unreadable first byte means there is nothing to point at.
        memory.read_u8(source).ok()?;

        let mut at = self.cursor;
        let mut src = Some(source);
        while at + 1 < self.end {
            let Some(byte) = src.and_then(|a| memory.read_u8(a).ok()) else {
                break;
            };
            if byte == 0 {
                break;
            }
            buf[at] = byte;
            at += 1;
            src = src.and_then(|a| a.checked_add(1));
        }
        buf[at] = 0;
        Some(at + 1 - self.cursor)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

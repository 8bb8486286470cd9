//! VESA BIOS Extensions: function numbers and the two data blocks the
//! engine itself looks at.

use thiserror::Error;

use crate::relocate::PointerField;

/// Software interrupt of the video BIOS.
pub const VIDEO_INTERRUPT: u8 = 0x10;

/// AX after a successful VBE call.
pub const VBE_SUCCESS: u16 = 0x004F;

pub const VBE_GET_CONTROLLER_INFO: u16 = 0x4F00;
pub const VBE_GET_MODE_INFO: u16 = 0x4F01;
pub const VBE_SET_MODE: u16 = 0x4F02;

/// Size of the Info Block proper; callers may pass a longer buffer whose
/// tail receives copied ROM data.
pub const INFO_BLOCK_LEN: usize = 512;
pub const MODE_INFO_LEN: usize = 256;

pub const VBE_MODE_LIST_END: u16 = 0xFFFF;

/// Signature a caller writes to ask for VBE 2.0+ fields.
pub const VBE2_SIGNATURE: &[u8; 4] = b"VBE2";
pub const VESA_SIGNATURE: &[u8; 4] = b"VESA";

/// Whether a call returned the VBE success code.
pub fn succeeded(ax: u16) -> bool {
    ax == VBE_SUCCESS
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VbeError {
    #[error("block is {len} bytes, expected at least {expected}")]
    TooShort { len: usize, expected: usize },

    #[error("bad Info Block signature {0:?}")]
    Signature([u8; 4]),
}

/// A relocated VBE Info Block: pointer fields hold offsets into the buffer
/// (0 for absent) rather than far pointers.
#[derive(Debug, Clone, Copy)]
pub struct InfoBlock<'a> {
    buf: &'a [u8],
}

impl<'a> InfoBlock<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, VbeError> {
        if buf.len() < INFO_BLOCK_LEN {
            return Err(VbeError::TooShort {
                len: buf.len(),
                expected: INFO_BLOCK_LEN,
            });
        }
        let signature = [buf[0], buf[1], buf[2], buf[3]];
        if &signature != VESA_SIGNATURE {
            return Err(VbeError::Signature(signature));
        }
        Ok(Self { buf })
    }

    /// BCD version, e.g. 0x0300 for VBE 3.0.
    pub fn version(&self) -> u16 {
        u16_at(self.buf, 4)
    }

    pub fn capabilities(&self) -> u32 {
        u32_at(self.buf, 10)
    }

    /// Video memory in bytes.
    pub fn total_memory(&self) -> u32 {
        u16_at(self.buf, 18) as u32 * 64 * 1024
    }

    pub fn oem_software_rev(&self) -> u16 {
        u16_at(self.buf, 20)
    }

    /// The string a relocated pointer field refers to.
    pub fn string(&self, field: PointerField) -> Option<&'a str> {
        let offset = u32_at(self.buf, field.offset()) as usize;
        if offset == 0 || offset >= self.buf.len() {
            return None;
        }
        let bytes = &self.buf[offset..];
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        core::str::from_utf8(&bytes[..end]).ok()
    }

    pub fn modes(&self) -> impl Iterator<Item = u16> + 'a {
        let offset = u32_at(self.buf, PointerField::ModeList.offset()) as usize;
        let list = if offset == 0 || offset >= self.buf.len() {
            &[][..]
        } else {
            &self.buf[offset..]
        };
        list.chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&mode| mode != VBE_MODE_LIST_END)
    }
}

/// The fields of a VBE Mode Info Block the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub attributes: u16,
    pub bytes_per_scan_line: u16,
    pub width: u16,
    pub height: u16,
    pub bits_per_pixel: u8,
    pub memory_model: u8,
    pub phys_base: u32,
}

impl ModeInfo {
    pub const ATTR_SUPPORTED: u16 = 0x01;
    pub const ATTR_GRAPHICS: u16 = 0x10;
    pub const ATTR_LINEAR_FRAMEBUFFER: u16 = 0x80;

    pub fn parse(buf: &[u8]) -> Result<Self, VbeError> {
        if buf.len() < MODE_INFO_LEN {
            return Err(VbeError::TooShort {
                len: buf.len(),
                expected: MODE_INFO_LEN,
            });
        }
        Ok(Self {
            attributes: u16_at(buf, 0),
            bytes_per_scan_line: u16_at(buf, 16),
            width: u16_at(buf, 18),
            height: u16_at(buf, 20),
            bits_per_pixel: buf[25],
            memory_model: buf[27],
            phys_base: u32_at(buf, 40),
        })
    }

    pub fn is_graphics(&self) -> bool {
        self.attributes & (Self::ATTR_SUPPORTED | Self::ATTR_GRAPHICS)
            == Self::ATTR_SUPPORTED | Self::ATTR_GRAPHICS
    }

    pub fn has_linear_framebuffer(&self) -> bool {
        self.attributes & Self::ATTR_LINEAR_FRAMEBUFFER != 0
    }
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relocated_block() -> Vec<u8> {
        let mut buf = vec![0u8; 600];
        buf[..4].copy_from_slice(VESA_SIGNATURE);
        buf[4..6].copy_from_slice(&0x0300u16.to_le_bytes());
        buf[6..10].copy_from_slice(&0x100u32.to_le_bytes());
        buf[14..18].copy_from_slice(&0x22u32.to_le_bytes());
        buf[18..20].copy_from_slice(&0x0100u16.to_le_bytes());
        buf[22..26].copy_from_slice(&512u32.to_le_bytes());
        for (i, mode) in [0x0101u16, 0x0118, 0xFFFF].iter().enumerate() {
            buf[0x22 + i * 2..0x24 + i * 2].copy_from_slice(&mode.to_le_bytes());
        }
        buf[0x100..0x105].copy_from_slice(b"OEM!\0");
        buf[512..517].copy_from_slice(b"Acme\0");
        buf
    }

    #[test]
    fn info_block_fields() {
        let buf = relocated_block();
        let ib = InfoBlock::parse(&buf).unwrap();
        assert_eq!(ib.version(), 0x0300);
        assert_eq!(ib.total_memory(), 16 * 1024 * 1024);
        assert_eq!(ib.string(PointerField::OemString), Some("OEM!"));
        assert_eq!(ib.string(PointerField::OemVendorName), Some("Acme"));
        assert_eq!(ib.string(PointerField::OemProductName), None);
        assert_eq!(ib.modes().collect::<Vec<_>>(), vec![0x0101, 0x0118]);
    }

    #[test]
    fn info_block_needs_vesa_signature() {
        let mut buf = relocated_block();
        buf[..4].copy_from_slice(VBE2_SIGNATURE);
        assert_eq!(
            InfoBlock::parse(&buf).unwrap_err(),
            VbeError::Signature(*VBE2_SIGNATURE)
        );
        assert!(matches!(
            InfoBlock::parse(&buf[..100]),
            Err(VbeError::TooShort { len: 100, .. })
        ));
    }

    #[test]
    fn mode_info_fields() {
        let mut buf = vec![0u8; MODE_INFO_LEN];
        buf[0..2].copy_from_slice(&0x009Bu16.to_le_bytes());
        buf[16..18].copy_from_slice(&4096u16.to_le_bytes());
        buf[18..20].copy_from_slice(&1024u16.to_le_bytes());
        buf[20..22].copy_from_slice(&768u16.to_le_bytes());
        buf[25] = 32;
        buf[27] = 6;
        buf[40..44].copy_from_slice(&0xE000_0000u32.to_le_bytes());

        let mode = ModeInfo::parse(&buf).unwrap();
        assert_eq!((mode.width, mode.height, mode.bits_per_pixel), (1024, 768, 32));
        assert_eq!(mode.phys_base, 0xE000_0000);
        assert!(mode.is_graphics());
        assert!(mode.has_linear_framebuffer());
    }
}

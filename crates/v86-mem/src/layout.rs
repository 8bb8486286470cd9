//! The fixed real-mode memory layout and the host probes that size it.

use std::{fs::File, os::unix::fs::FileExt, path::PathBuf};

use tracing::{debug, warn};

use crate::{
    Backing, HostWindow, MapError, MemoryRegion, Placement, RealModeAddress, RealModeMemory,
    RegionKind, RegionMap, Sharing,
};

pub const IVT_BDA_BASE: u32 = 0x0_0000;
pub const IVT_BDA_SIZE: u32 = 0x1000;

pub const SCRATCH_BASE: u32 = 0x1_0000;
pub const SCRATCH_SIZE: u32 = 0x2_0000;

/// BDA word holding the EBDA segment.
pub const BDA_EBDA_SEGMENT: u32 = 0x40E;
/// Lowest EBDA start we accept; anything below is treated as garbage.
pub const EBDA_MIN_BASE: u32 = 0x8_0000;

pub const VRAM_BASE: u32 = 0xA_0000;
pub const VRAM_SIZE: u32 = 0x2_0000;

pub const VIDEO_BIOS_BASE: u32 = 0xC_0000;
/// Largest window the video ROM may occupy (up to the system BIOS).
pub const VIDEO_BIOS_MAX_SIZE: u32 = 0x2_0000;
/// Window used when the option ROM header is missing or implausible.
pub const VIDEO_BIOS_DEFAULT_SIZE: u32 = 0x1_0000;

pub const SYSTEM_BIOS_BASE: u32 = 0xE_0000;
pub const SYSTEM_BIOS_SIZE: u32 = 0x2_0000;

const OPTION_ROM_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const OPTION_ROM_BLOCK: u32 = 512;

/// Where the EBDA sits and how large it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EbdaWindow {
    pub base: u32,
    pub size: u32,
}

/// Interprets the BDA's EBDA segment and the size byte (in KiB) found at the
/// start of the EBDA.
///
/// A segment outside `EBDA_MIN_BASE..VRAM_BASE` means there is no usable
/// EBDA. A size that would run into the framebuffer is shrunk to end at
/// [`VRAM_BASE`].
pub fn ebda_window(segment: u16, size_kib: u8) -> Option<EbdaWindow> {
    let base = (segment as u32) << 4;
    if !(EBDA_MIN_BASE..VRAM_BASE).contains(&base) {
        return None;
    }
    let room = VRAM_BASE - base;
    let size = match size_kib as u32 * 1024 {
        0 => room,
        size if size > room => {
            warn!(base, size, "EBDA size runs into VRAM, shrinking");
            room
        }
        size => size,
    };
    Some(EbdaWindow { base, size })
}

/// Size of the video BIOS window given the first bytes of the option ROM.
///
/// A valid header (`55 AA` followed by a length in 512-byte blocks) shrinks
/// the window to the ROM's own size rounded up to 4 KiB; anything else maps
/// [`VIDEO_BIOS_DEFAULT_SIZE`].
pub fn video_bios_window(header: &[u8]) -> u32 {
    let declared = match header {
        [a, b, blocks, ..] if [*a, *b] == OPTION_ROM_SIGNATURE => *blocks as u32 * OPTION_ROM_BLOCK,
        _ => {
            warn!("video BIOS option ROM signature missing");
            return VIDEO_BIOS_DEFAULT_SIZE;
        }
    };
    if declared == 0 || declared > VIDEO_BIOS_MAX_SIZE {
        warn!(declared, "implausible video BIOS size");
        return VIDEO_BIOS_DEFAULT_SIZE;
    }
    (declared + 0xFFF) & !0xFFF
}

/// How to build a [`RegionMap`] from the host's physical memory.
#[derive(Debug, Clone)]
pub struct HostLayout {
    /// Physical memory device, normally `/dev/mem`.
    pub device: PathBuf,
    pub placement: Placement,
    /// Scratch pool descriptor capacity.
    pub block_capacity: usize,
}

impl HostLayout {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            placement: Placement::Anywhere,
            block_capacity: crate::DEFAULT_BLOCK_CAPACITY,
        }
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn block_capacity(mut self, capacity: usize) -> Self {
        self.block_capacity = capacity;
        self
    }

    /// Maps every region of the layout.
    ///
    /// IVT/BDA, EBDA and VRAM are shared with physical memory so BIOS state
    /// changes persist; the ROMs are private copies; the scratch region is
    /// anonymous.
    pub fn map(&self) -> Result<RegionMap, MapError> {
        let device = File::open(&self.device).map_err(|source| MapError::Device {
            path: self.device.clone(),
            source,
        })?;
        let mut map = RegionMap::new(self.block_capacity);

        map.insert(self.physical(RegionKind::IvtBda, IVT_BDA_BASE, IVT_BDA_SIZE, Sharing::Shared)?)?;

        let scratch = HostWindow::anonymous(SCRATCH_BASE, SCRATCH_SIZE as usize, self.placement)?;
        map.insert(MemoryRegion::new(
            RegionKind::Scratch,
            addr(SCRATCH_BASE),
            Backing::Host(scratch),
        ))?;

        let segment = read_u16(&map, BDA_EBDA_SEGMENT);
        let size_kib = read_byte(&device, (segment as u64) << 4).unwrap_or(0);
        match ebda_window(segment, size_kib) {
            Some(EbdaWindow { base, size }) => {
                map.insert(self.physical(RegionKind::Ebda, base, size, Sharing::Shared)?)?;
            }
            None => warn!(segment, "no usable EBDA advertised by the BDA"),
        }

        map.insert(self.physical(RegionKind::Vram, VRAM_BASE, VRAM_SIZE, Sharing::Shared)?)?;

        let mut header = [0u8; 3];
        let header = match device.read_exact_at(&mut header, VIDEO_BIOS_BASE as u64) {
            Ok(()) => &header[..],
            Err(err) => {
                warn!("failed to read video BIOS header: {err}");
                &[][..]
            }
        };
        let vbios_size = video_bios_window(header);
        map.insert(self.physical(
            RegionKind::VideoBios,
            VIDEO_BIOS_BASE,
            vbios_size,
            Sharing::Private,
        )?)?;

        map.insert(self.physical(
            RegionKind::SystemBios,
            SYSTEM_BIOS_BASE,
            SYSTEM_BIOS_SIZE,
            Sharing::Private,
        )?)?;

        debug!(device = %self.device.display(), "host memory layout mapped");
        Ok(map)
    }

    fn physical(
        &self,
        kind: RegionKind,
        base: u32,
        size: u32,
        sharing: Sharing,
    ) -> Result<MemoryRegion, MapError> {
        let window = HostWindow::physical(&self.device, base, size as usize, sharing, self.placement)?;
        Ok(MemoryRegion::new(kind, addr(base), Backing::Host(window)))
    }
}

fn addr(linear: u32) -> RealModeAddress {
    RealModeAddress::wrapping(0, linear)
}

fn read_u16(map: &RegionMap, linear: u32) -> u16 {
    map.read_u16(addr(linear)).unwrap_or(0)
}

fn read_byte(device: &File, phys: u64) -> Option<u8> {
    let mut byte = [0u8; 1];
    device.read_exact_at(&mut byte, phys).ok().map(|()| byte[0])
}

use core::fmt;

use tracing::debug;

use crate::{
    alloc::{ScratchPool, DEFAULT_BLOCK_CAPACITY},
    AllocError, HostWindow, MapError, MemoryError, RealModeAddress, REAL_MODE_LIMIT,
};

/// The named windows of the first megabyte that BIOS code may touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Interrupt vector table and BIOS data area.
    IvtBda,
    /// Private scratch memory for stacks, return stubs and call buffers.
    Scratch,
    /// Extended BIOS data area.
    Ebda,
    /// Legacy VGA framebuffer window.
    Vram,
    /// Video BIOS option ROM.
    VideoBios,
    /// System BIOS ROM.
    SystemBios,
}

impl RegionKind {
    pub const ALL: [RegionKind; 6] = [
        RegionKind::IvtBda,
        RegionKind::Scratch,
        RegionKind::Ebda,
        RegionKind::Vram,
        RegionKind::VideoBios,
        RegionKind::SystemBios,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RegionKind::IvtBda => "IVT/BDA",
            RegionKind::Scratch => "scratch",
            RegionKind::Ebda => "EBDA",
            RegionKind::Vram => "VRAM",
            RegionKind::VideoBios => "video BIOS",
            RegionKind::SystemBios => "system BIOS",
        }
    }

    /// Lookup order used by [`RegionMap::resolve`]: BIOS calls hit the video
    /// ROM and the scratch buffer far more often than anything else.
    fn lookup_rank(self) -> u8 {
        match self {
            RegionKind::VideoBios => 0,
            RegionKind::Scratch => 1,
            RegionKind::IvtBda => 2,
            RegionKind::SystemBios => 3,
            RegionKind::Ebda => 4,
            RegionKind::Vram => 5,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host storage behind a region.
#[derive(Debug)]
pub enum Backing {
    /// Plain process memory. Used for tests and for regions that need no
    /// particular host placement.
    Anonymous(Vec<u8>),
    /// An `mmap` of the memory device or of anonymous pages.
    Host(HostWindow),
}

impl Backing {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Anonymous(bytes) => bytes,
            Backing::Host(window) => window.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Backing::Anonymous(bytes) => bytes,
            Backing::Host(window) => window.as_mut_slice(),
        }
    }
}

#[derive(Debug)]
pub struct MemoryRegion {
    kind: RegionKind,
    base: RealModeAddress,
    backing: Backing,
}

impl MemoryRegion {
    pub fn new(kind: RegionKind, base: RealModeAddress, backing: Backing) -> Self {
        Self {
            kind,
            base,
            backing,
        }
    }

    /// A zero-filled region held in process memory.
    pub fn zeroed(kind: RegionKind, base: RealModeAddress, len: usize) -> Self {
        Self::new(kind, base, Backing::Anonymous(vec![0; len]))
    }

    /// A region initialised from `bytes`.
    pub fn with_contents(kind: RegionKind, base: RealModeAddress, bytes: Vec<u8>) -> Self {
        Self::new(kind, base, Backing::Anonymous(bytes))
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn base(&self) -> RealModeAddress {
        self.base
    }

    pub fn len(&self) -> usize {
        self.backing.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the last linear address of the region.
    pub fn end(&self) -> u32 {
        self.base.linear() + self.len() as u32
    }

    pub fn contains(&self, addr: RealModeAddress) -> bool {
        addr >= self.base && addr.linear() < self.end()
    }

    pub fn bytes(&self) -> &[u8] {
        self.backing.as_slice()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.backing.as_mut_slice()
    }
}

/// Memory operations a BIOS call needs from whatever owns the real-mode
/// address space.
///
/// Multi-byte accessors are little-endian and may span adjacent regions.
pub trait RealModeMemory {
    fn alloc(&mut self, size: u32) -> Result<RealModeAddress, AllocError>;
    fn free(&mut self, addr: RealModeAddress) -> Result<(), AllocError>;
    fn read(&self, addr: RealModeAddress, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write(&mut self, addr: RealModeAddress, data: &[u8]) -> Result<(), MemoryError>;

    fn read_u8(&self, addr: RealModeAddress) -> Result<u8, MemoryError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: RealModeAddress) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: RealModeAddress) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u8(&mut self, addr: RealModeAddress, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    fn write_u16(&mut self, addr: RealModeAddress, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u32(&mut self, addr: RealModeAddress, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// The set of mapped regions plus the scratch pool carved out of the
/// scratch region.
#[derive(Debug)]
pub struct RegionMap {
    /// Sorted by lookup rank, not by address.
    regions: Vec<MemoryRegion>,
    pool: Option<ScratchPool>,
    block_capacity: usize,
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_CAPACITY)
    }
}

impl RegionMap {
    /// An empty map whose scratch pool, once a scratch region is inserted,
    /// tracks at most `block_capacity` blocks.
    pub fn new(block_capacity: usize) -> Self {
        Self {
            regions: Vec::new(),
            pool: None,
            block_capacity,
        }
    }

    /// Adds a region, rejecting empty, oversized or overlapping ones.
    pub fn insert(&mut self, region: MemoryRegion) -> Result<(), MapError> {
        let kind = region.kind();
        let base = region.base();
        if region.is_empty() {
            return Err(MapError::Empty { kind });
        }
        if base.linear() as usize + region.len() > REAL_MODE_LIMIT as usize {
            return Err(MapError::OutOfRange {
                kind,
                base,
                len: region.len(),
            });
        }
        if let Some(other) = self
            .regions
            .iter()
            .find(|r| base.linear() < r.end() && r.base().linear() < region.end())
        {
            return Err(MapError::Overlap {
                kind,
                base,
                other: other.kind(),
            });
        }
        if kind == RegionKind::Scratch {
            if self.pool.is_some() {
                return Err(MapError::DuplicateScratch);
            }
            self.pool = Some(ScratchPool::new(
                base,
                region.len() as u32,
                self.block_capacity,
            ));
        }

        debug!(%kind, %base, len = region.len(), "mapped region");
        let at = self
            .regions
            .partition_point(|r| r.kind().lookup_rank() <= kind.lookup_rank());
        self.regions.insert(at, region);
        Ok(())
    }

    /// Builder-style [`RegionMap::insert`].
    pub fn with(mut self, region: MemoryRegion) -> Result<Self, MapError> {
        self.insert(region)?;
        Ok(self)
    }

    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }

    pub fn region(&self, kind: RegionKind) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.kind() == kind)
    }

    pub fn pool(&self) -> Option<&ScratchPool> {
        self.pool.as_ref()
    }

    /// The region holding `addr` and the offset of `addr` inside it.
    pub fn resolve(&self, addr: RealModeAddress) -> Result<(&MemoryRegion, usize), MemoryError> {
        self.regions
            .iter()
            .find(|r| r.contains(addr))
            .map(|r| (r, (addr.linear() - r.base().linear()) as usize))
            .ok_or(MemoryError::Unmapped { addr: addr.linear() })
    }

    fn resolve_mut(
        &mut self,
        addr: RealModeAddress,
    ) -> Result<(&mut MemoryRegion, usize), MemoryError> {
        self.regions
            .iter_mut()
            .find(|r| r.contains(addr))
            .map(|r| {
                let off = (addr.linear() - r.base().linear()) as usize;
                (r, off)
            })
            .ok_or(MemoryError::Unmapped { addr: addr.linear() })
    }

    /// Borrowed view of a run of bytes that lies inside a single region.
    pub fn slice(&self, addr: RealModeAddress, len: usize) -> Result<&[u8], MemoryError> {
        let (region, off) = self.resolve(addr)?;
        region
            .bytes()
            .get(off..off + len)
            .ok_or(MemoryError::Unmapped {
                addr: region.end(),
            })
    }
}

impl RealModeMemory for RegionMap {
    fn alloc(&mut self, size: u32) -> Result<RealModeAddress, AllocError> {
        self.pool.as_mut().ok_or(AllocError::NoPool)?.alloc(size)
    }

    fn free(&mut self, addr: RealModeAddress) -> Result<(), AllocError> {
        self.pool.as_mut().ok_or(AllocError::NoPool)?.free(addr)
    }

    fn read(&self, addr: RealModeAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut cursor = addr.linear();
        let mut done = 0;
        while done < buf.len() {
            let (region, off) = self.resolve(RealModeAddress::checked(cursor)?)?;
            let n = (region.len() - off).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&region.bytes()[off..off + n]);
            done += n;
            cursor += n as u32;
        }
        Ok(())
    }

    fn write(&mut self, addr: RealModeAddress, data: &[u8]) -> Result<(), MemoryError> {
        let mut cursor = addr.linear();
        let mut done = 0;
        while done < data.len() {
            let (region, off) = self.resolve_mut(RealModeAddress::checked(cursor)?)?;
            let n = (region.len() - off).min(data.len() - done);
            region.bytes_mut()[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
            cursor += n as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(linear: u32) -> RealModeAddress {
        RealModeAddress::new(linear).unwrap()
    }

    fn small_map() -> RegionMap {
        RegionMap::default()
            .with(MemoryRegion::zeroed(RegionKind::IvtBda, addr(0), 0x1000))
            .unwrap()
            .with(MemoryRegion::zeroed(RegionKind::Scratch, addr(0x10000), 0x20000))
            .unwrap()
            .with(MemoryRegion::zeroed(RegionKind::VideoBios, addr(0xC0000), 0x8000))
            .unwrap()
    }

    #[test]
    fn resolve_returns_region_and_offset() {
        let map = small_map();
        let (region, off) = map.resolve(addr(0xC0123)).unwrap();
        assert_eq!(region.kind(), RegionKind::VideoBios);
        assert_eq!(off, 0x123);

        let (region, off) = map.resolve(addr(0x2FFFF)).unwrap();
        assert_eq!(region.kind(), RegionKind::Scratch);
        assert_eq!(off, 0x1FFFF);
    }

    #[test]
    fn unmapped_address_is_an_error() {
        let map = small_map();
        assert_eq!(
            map.resolve(addr(0x5000)).unwrap_err(),
            MemoryError::Unmapped { addr: 0x5000 }
        );
        assert!(map.read_u8(addr(0xC8000)).is_err());
    }

    #[test]
    fn overlapping_region_is_rejected() {
        let mut map = small_map();
        let err = map
            .insert(MemoryRegion::zeroed(RegionKind::Vram, addr(0xBF000), 0x2000))
            .unwrap_err();
        assert!(matches!(
            err,
            MapError::Overlap {
                kind: RegionKind::Vram,
                other: RegionKind::VideoBios,
                ..
            }
        ));
    }

    #[test]
    fn second_scratch_region_is_rejected() {
        let mut map = small_map();
        assert!(matches!(
            map.insert(MemoryRegion::zeroed(RegionKind::Scratch, addr(0x40000), 0x1000)),
            Err(MapError::DuplicateScratch)
        ));
    }

    #[test]
    fn region_past_one_megabyte_is_rejected() {
        let mut map = RegionMap::default();
        assert!(matches!(
            map.insert(MemoryRegion::zeroed(RegionKind::SystemBios, addr(0xF0000), 0x20000)),
            Err(MapError::OutOfRange { .. })
        ));
    }

    #[test]
    fn accesses_span_adjacent_regions() {
        let mut map = RegionMap::default()
            .with(MemoryRegion::zeroed(RegionKind::Ebda, addr(0x9FC00), 0x400))
            .unwrap()
            .with(MemoryRegion::zeroed(RegionKind::Vram, addr(0xA0000), 0x20000))
            .unwrap();
        map.write_u32(addr(0x9FFFE), 0xDDCC_BBAA).unwrap();
        assert_eq!(map.read_u16(addr(0x9FFFE)).unwrap(), 0xBBAA);
        assert_eq!(map.read_u16(addr(0xA0000)).unwrap(), 0xDDCC);
        assert_eq!(map.read_u32(addr(0x9FFFE)).unwrap(), 0xDDCC_BBAA);
    }

    #[test]
    fn allocations_come_from_the_scratch_region() {
        let mut map = small_map();
        let a = map.alloc(0x2000).unwrap();
        assert_eq!(a, addr(0x10000));
        map.write(a, b"VBE2").unwrap();
        assert_eq!(map.slice(a, 4).unwrap(), b"VBE2");
        map.free(a).unwrap();
        assert_eq!(map.pool().unwrap().free_bytes(), 0x20000);
    }

    #[test]
    fn alloc_without_scratch_region_fails() {
        let mut map = RegionMap::default();
        assert_eq!(map.alloc(16), Err(AllocError::NoPool));
    }
}

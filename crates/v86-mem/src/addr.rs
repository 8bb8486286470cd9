use core::fmt;

use crate::MemoryError;

/// One past the highest byte reachable from real mode with the A20 gate closed.
pub const REAL_MODE_LIMIT: u32 = 0x10_0000;

/// A linear address inside the first megabyte.
///
/// Real-mode code names memory as `segment:offset`; everything below this
/// crate works on the 20-bit linear form and converts at the edges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RealModeAddress(u32);

impl RealModeAddress {
    pub const ZERO: Self = Self(0);

    /// Wraps a linear address, rejecting anything at or above 1 MiB.
    pub const fn new(linear: u32) -> Option<Self> {
        if linear < REAL_MODE_LIMIT {
            Some(Self(linear))
        } else {
            None
        }
    }

    pub fn checked(linear: u32) -> Result<Self, MemoryError> {
        Self::new(linear).ok_or(MemoryError::OutOfRange { addr: linear })
    }

    /// `segment * 16 + offset`, rejecting the high-memory area above 1 MiB.
    pub fn from_seg_off(segment: u16, offset: u16) -> Result<Self, MemoryError> {
        Self::checked(((segment as u32) << 4) + offset as u32)
    }

    /// `segment * 16 + offset` with the A20 line masked, as the CPU computes it.
    pub fn wrapping(segment: u16, offset: u32) -> Self {
        Self((((segment as u32) << 4).wrapping_add(offset)) & (REAL_MODE_LIMIT - 1))
    }

    /// Decodes a far pointer stored as `segment << 16 | offset`.
    pub fn from_far_ptr(ptr: u32) -> Result<Self, MemoryError> {
        Self::from_seg_off((ptr >> 16) as u16, ptr as u16)
    }

    pub const fn linear(self) -> u32 {
        self.0
    }

    /// Canonical `segment:offset` form with the offset in `0..16`.
    pub const fn to_seg_off(self) -> (u16, u16) {
        ((self.0 >> 4) as u16, (self.0 & 0xF) as u16)
    }

    /// The segment that addresses this location at offset zero, if it is
    /// paragraph aligned.
    pub const fn paragraph(self) -> Option<u16> {
        if self.0 & 0xF == 0 {
            Some((self.0 >> 4) as u16)
        } else {
            None
        }
    }

    pub fn checked_add(self, delta: u32) -> Option<Self> {
        self.0.checked_add(delta).and_then(Self::new)
    }

    /// Distance from `base` to `self`, if `self` is not below `base`.
    pub fn offset_from(self, base: Self) -> Option<u32> {
        self.0.checked_sub(base.0)
    }
}

impl fmt::Display for RealModeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#07x}", self.0)
    }
}

impl From<RealModeAddress> for u32 {
    fn from(value: RealModeAddress) -> Self {
        value.0
    }
}

impl TryFrom<u32> for RealModeAddress {
    type Error = MemoryError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::checked(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seg_off_composes_linear_address() {
        let addr = RealModeAddress::from_seg_off(0xC000, 0x0123).unwrap();
        assert_eq!(addr.linear(), 0xC0123);
        assert_eq!(addr.to_seg_off(), (0xC012, 0x3));
    }

    #[test]
    fn high_memory_area_is_rejected() {
        assert!(matches!(
            RealModeAddress::from_seg_off(0xFFFF, 0x0010),
            Err(MemoryError::OutOfRange { addr: 0x10_0000 })
        ));
        assert!(RealModeAddress::new(REAL_MODE_LIMIT).is_none());
        assert!(RealModeAddress::new(REAL_MODE_LIMIT - 1).is_some());
    }

    #[test]
    fn wrapping_masks_a20() {
        assert_eq!(RealModeAddress::wrapping(0xFFFF, 0x0010).linear(), 0);
        assert_eq!(RealModeAddress::wrapping(0x1000, 0xFFFF).linear(), 0x1FFFF);
    }

    #[test]
    fn far_pointer_splits_segment_and_offset() {
        let addr = RealModeAddress::from_far_ptr(0xC000_0040).unwrap();
        assert_eq!(addr.linear(), 0xC0040);
    }

    #[test]
    fn paragraph_only_for_aligned_addresses() {
        assert_eq!(RealModeAddress::new(0x12340).unwrap().paragraph(), Some(0x1234));
        assert_eq!(RealModeAddress::new(0x12341).unwrap().paragraph(), None);
    }
}

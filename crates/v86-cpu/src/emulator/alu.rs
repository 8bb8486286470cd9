//! Arithmetic flag computation.
//!
//! Every helper takes the operand size in bytes (1, 2 or 4) and returns the
//! masked result together with the arithmetic flags it defines. Callers
//! merge those into EFLAGS with [`merge`].

use crate::state::{FLAGS_ARITH, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

pub(crate) fn mask(size: u32) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

pub(crate) fn sign_bit(size: u32) -> u32 {
    1 << (size * 8 - 1)
}

pub(crate) fn sign_extend(value: u32, size: u32) -> i64 {
    match size {
        1 => value as u8 as i8 as i64,
        2 => value as u16 as i16 as i64,
        _ => value as i32 as i64,
    }
}

/// Replaces the arithmetic flags selected by `affected`.
pub(crate) fn merge(eflags: u32, flags: u32, affected: u32) -> u32 {
    (eflags & !affected) | (flags & affected)
}

fn parity(value: u32) -> bool {
    (value as u8).count_ones() % 2 == 0
}

/// SF, ZF and PF of a result.
pub(crate) fn szp(size: u32, result: u32) -> u32 {
    let mut flags = 0;
    if result & mask(size) == 0 {
        flags |= FLAG_ZF;
    }
    if result & sign_bit(size) != 0 {
        flags |= FLAG_SF;
    }
    if parity(result) {
        flags |= FLAG_PF;
    }
    flags
}

pub(crate) fn add(size: u32, a: u32, b: u32, carry: bool) -> (u32, u32) {
    let m = mask(size);
    let (a, b) = (a & m, b & m);
    let wide = a as u64 + b as u64 + carry as u64;
    let r = wide as u32 & m;
    let mut flags = szp(size, r);
    if wide > m as u64 {
        flags |= FLAG_CF;
    }
    if (a ^ r) & (b ^ r) & sign_bit(size) != 0 {
        flags |= FLAG_OF;
    }
    if (a ^ b ^ r) & 0x10 != 0 {
        flags |= FLAG_AF;
    }
    (r, flags)
}

pub(crate) fn sub(size: u32, a: u32, b: u32, borrow: bool) -> (u32, u32) {
    let m = mask(size);
    let (a, b) = (a & m, b & m);
    let r = a.wrapping_sub(b).wrapping_sub(borrow as u32) & m;
    let mut flags = szp(size, r);
    if (b as u64 + borrow as u64) > a as u64 {
        flags |= FLAG_CF;
    }
    if (a ^ b) & (a ^ r) & sign_bit(size) != 0 {
        flags |= FLAG_OF;
    }
    if (a ^ b ^ r) & 0x10 != 0 {
        flags |= FLAG_AF;
    }
    (r, flags)
}

/// AND/OR/XOR/TEST: CF, OF and AF are cleared.
pub(crate) fn logic(size: u32, r: u32) -> (u32, u32) {
    let r = r & mask(size);
    (r, szp(size, r))
}

pub(crate) const ALL: u32 = FLAGS_ARITH;

/// DAA (`sub == false`) or DAS on AL. Defines CF, AF, SF, ZF and PF; OF
/// comes back clear.
pub(crate) fn decimal_adjust(al: u8, cf: bool, af: bool, sub: bool) -> (u8, u32) {
    let mut r = al;
    let mut flags = 0;
    if al & 0x0F > 9 || af {
        r = if sub { r.wrapping_sub(6) } else { r.wrapping_add(6) };
        flags |= FLAG_AF;
    }
    if al > 0x99 || cf {
        r = if sub { r.wrapping_sub(0x60) } else { r.wrapping_add(0x60) };
        flags |= FLAG_CF;
    }
    (r, flags | szp(1, r as u32))
}

/// AAA (`sub == false`) or AAS on AX. Only CF and AF are defined; both are
/// set when a decimal carry or borrow was applied.
pub(crate) fn ascii_adjust(ax: u16, af: bool, sub: bool) -> (u16, u32) {
    if ax & 0x0F <= 9 && !af {
        return (ax & 0xFF0F, 0);
    }
    let ax = if sub {
        let t = ax.wrapping_sub(6);
        let ah = ((t >> 8) as u8).wrapping_sub(1);
        (ah as u16) << 8 | (t & 0xFF)
    } else {
        ax.wrapping_add(0x106)
    };
    (ax & 0xFF0F, FLAG_AF | FLAG_CF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sets_carry_and_overflow() {
        let (r, f) = add(1, 0xFF, 0x01, false);
        assert_eq!(r, 0);
        assert_eq!(f & (FLAG_CF | FLAG_ZF | FLAG_OF), FLAG_CF | FLAG_ZF);
        assert_ne!(f & FLAG_AF, 0);

        let (r, f) = add(2, 0x7FFF, 0x0001, false);
        assert_eq!(r, 0x8000);
        assert_eq!(f & (FLAG_CF | FLAG_OF | FLAG_SF), FLAG_OF | FLAG_SF);
    }

    #[test]
    fn sub_borrow_semantics() {
        let (r, f) = sub(2, 0x0000, 0x0001, false);
        assert_eq!(r, 0xFFFF);
        assert_ne!(f & FLAG_CF, 0);
        assert_eq!(f & FLAG_OF, 0);

        let (r, f) = sub(1, 0x80, 0x01, false);
        assert_eq!(r, 0x7F);
        assert_ne!(f & FLAG_OF, 0);

        let (r, f) = sub(4, 5, 4, true);
        assert_eq!(r, 0);
        assert_ne!(f & FLAG_ZF, 0);
        assert_eq!(f & FLAG_CF, 0);
    }

    #[test]
    fn decimal_adjust_after_packed_bcd_arithmetic() {
        // 79 + 35 = 0xAE -> 114
        let (r, f) = decimal_adjust(0xAE, false, false, false);
        assert_eq!(r, 0x14);
        assert_eq!(f & (FLAG_CF | FLAG_AF), FLAG_CF | FLAG_AF);

        // 12 + 34 = 0x46 needs no adjustment
        let (r, f) = decimal_adjust(0x46, false, false, false);
        assert_eq!(r, 0x46);
        assert_eq!(f & (FLAG_CF | FLAG_AF), 0);

        // 35 - 47 = 0xEE with borrow -> 88
        let (r, f) = decimal_adjust(0xEE, true, true, true);
        assert_eq!(r, 0x88);
        assert_eq!(f & (FLAG_CF | FLAG_AF), FLAG_CF | FLAG_AF);
    }

    #[test]
    fn ascii_adjust_carries_into_ah() {
        assert_eq!(ascii_adjust(0x0011, true, false), (0x0107, FLAG_AF | FLAG_CF));
        assert_eq!(ascii_adjust(0x0205, false, false), (0x0205, 0));
        // 2 - 5 leaves AL = 0xFD with a nibble borrow
        assert_eq!(ascii_adjust(0x01FD, true, true), (0x0007, FLAG_AF | FLAG_CF));
        assert_eq!(ascii_adjust(0x03F4, false, true), (0x0304, 0));
    }

    #[test]
    fn parity_counts_low_byte_only() {
        assert_ne!(szp(2, 0x0300) & FLAG_PF, 0);
        assert_eq!(szp(2, 0x0001) & FLAG_PF, 0);
        assert_ne!(szp(1, 0x03) & FLAG_PF, 0);
    }
}

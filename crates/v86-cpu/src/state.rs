pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_RESERVED: u32 = 1 << 1;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
pub const FLAG_IOPL: u32 = 3 << 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_VIF: u32 = 1 << 19;

pub const FLAGS_ARITH: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

/// Flags real-mode code starts out with: I/O privilege level 3 so port
/// accesses are permitted, everything else clear.
pub const DEFAULT_FLAGS: u32 = FLAG_RESERVED | FLAG_IOPL;

/// Register file exchanged with BIOS code.
///
/// This is the backend-neutral form: every execution backend translates it
/// to and from its own register layout around a call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuState {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
}

macro_rules! word_accessors {
    ($($reg:ident: $get:ident / $set:ident),* $(,)?) => {
        $(
            pub fn $get(&self) -> u16 {
                self.$reg as u16
            }

            pub fn $set(&mut self, value: u16) {
                self.$reg = (self.$reg & !0xFFFF) | value as u32;
            }
        )*
    };
}

macro_rules! byte_accessors {
    ($($reg:ident: $lo:ident / $set_lo:ident, $hi:ident / $set_hi:ident),* $(,)?) => {
        $(
            pub fn $lo(&self) -> u8 {
                self.$reg as u8
            }

            pub fn $set_lo(&mut self, value: u8) {
                self.$reg = (self.$reg & !0xFF) | value as u32;
            }

            pub fn $hi(&self) -> u8 {
                (self.$reg >> 8) as u8
            }

            pub fn $set_hi(&mut self, value: u8) {
                self.$reg = (self.$reg & !0xFF00) | ((value as u32) << 8);
            }
        )*
    };
}

impl CpuState {
    word_accessors! {
        eax: ax / set_ax,
        ebx: bx / set_bx,
        ecx: cx / set_cx,
        edx: dx / set_dx,
        esi: si / set_si,
        edi: di / set_di,
        ebp: bp / set_bp,
        esp: sp / set_sp,
        eip: ip / set_ip,
    }

    byte_accessors! {
        eax: al / set_al, ah / set_ah,
        ebx: bl / set_bl, bh / set_bh,
        ecx: cl / set_cl, ch / set_ch,
        edx: dl / set_dl, dh / set_dh,
    }

    pub fn flag(&self, flag: u32) -> bool {
        self.eflags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32, value: bool) {
        if value {
            self.eflags |= flag;
        } else {
            self.eflags &= !flag;
        }
    }

    /// Replaces the low 16 bits of EFLAGS, keeping bit 1 set.
    pub fn set_flags16(&mut self, value: u16) {
        self.eflags = (self.eflags & !0xFFFF) | value as u32 | FLAG_RESERVED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_register_writes_preserve_neighbours() {
        let mut regs = CpuState {
            eax: 0x1234_5678,
            ..Default::default()
        };
        regs.set_ah(0xAB);
        assert_eq!(regs.eax, 0x1234_AB78);
        regs.set_al(0xCD);
        assert_eq!(regs.eax, 0x1234_ABCD);
        regs.set_ax(0x004F);
        assert_eq!(regs.eax, 0x1234_004F);
        assert_eq!(regs.ax(), 0x004F);
        assert_eq!(regs.ah(), 0x00);
    }

    #[test]
    fn flags16_keeps_reserved_bit_and_upper_half() {
        let mut regs = CpuState {
            eflags: FLAG_VIF | FLAG_IF,
            ..Default::default()
        };
        regs.set_flags16((FLAG_CF | FLAG_ZF) as u16);
        assert_eq!(regs.eflags, FLAG_VIF | FLAG_CF | FLAG_ZF | FLAG_RESERVED);
        assert!(regs.flag(FLAG_ZF));
        regs.set_flag(FLAG_ZF, false);
        assert!(!regs.flag(FLAG_ZF));
    }
}

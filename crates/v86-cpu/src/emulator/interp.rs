//! Single-step real-mode interpreter.
//!
//! Instructions are decoded with `iced-x86` in 16-bit mode and executed
//! directly against a [`CpuState`]. Only what real-mode BIOS code uses is
//! implemented: no protection checks, no paging, no FPU or SIMD. Operand and
//! address size prefixes are honoured, so 32-bit register code in a video
//! BIOS runs as on hardware.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
    time::Instant,
};

use iced_x86::{ConditionCode, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use v86_mem::{RealModeAddress, RealModeMemory, RegionMap};

use super::alu::{self, mask, sign_bit, sign_extend};
use crate::{
    state::{
        CpuState, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_IF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_TF,
        FLAG_ZF,
    },
    BackendError, PortIo,
};

const MAX_INSTRUCTION_LEN: usize = 15;

/// EFLAGS bits writable by POPF/IRET from real mode.
const POPF_MASK_16: u32 = 0x7FD5;
const POPF_MASK_32: u32 = POPF_MASK_16 | (1 << 18) | (1 << 21);

const VECTOR_DIVIDE_ERROR: u8 = 0;
const VECTOR_BREAKPOINT: u8 = 3;
const VECTOR_OVERFLOW: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepExit {
    Continue,
    /// A `HLT` at `cs:ip` was executed.
    Halted { cs: u16, ip: u32 },
}

/// Memory and port access as seen by the interpreter.
pub(crate) trait Bus {
    fn read(&mut self, addr: RealModeAddress, size: u32) -> Result<u32, BackendError>;
    fn write(&mut self, addr: RealModeAddress, size: u32, value: u32) -> Result<(), BackendError>;
    fn io_read(&mut self, port: u16, size: u32) -> u32;
    fn io_write(&mut self, port: u16, size: u32, value: u32);

    fn fetch(&mut self, addr: RealModeAddress) -> Result<u8, BackendError> {
        Ok(self.read(addr, 1)? as u8)
    }
}

pub(crate) struct SystemBus<'a, P> {
    pub(crate) memory: &'a mut RegionMap,
    pub(crate) ports: &'a mut P,
}

impl<P: PortIo> Bus for SystemBus<'_, P> {
    fn read(&mut self, addr: RealModeAddress, size: u32) -> Result<u32, BackendError> {
        let mut value = 0u32;
        for i in 0..size {
            let byte = self.memory.read_u8(byte_addr(addr, i))?;
            value |= (byte as u32) << (i * 8);
        }
        Ok(value)
    }

    fn write(&mut self, addr: RealModeAddress, size: u32, value: u32) -> Result<(), BackendError> {
        for i in 0..size {
            self.memory
                .write_u8(byte_addr(addr, i), (value >> (i * 8)) as u8)?;
        }
        Ok(())
    }

    fn io_read(&mut self, port: u16, size: u32) -> u32 {
        self.ports.read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u32, value: u32) {
        self.ports.write(port, size, value)
    }
}

fn byte_addr(addr: RealModeAddress, i: u32) -> RealModeAddress {
    RealModeAddress::wrapping(0, addr.linear() + i)
}

/// Fetches, decodes and executes the instruction at `CS:IP`.
pub(crate) fn step<B: Bus>(cpu: &mut CpuState, bus: &mut B) -> Result<StepExit, BackendError> {
    let ip = cpu.eip & 0xFFFF;
    let mut bytes = [0u8; MAX_INSTRUCTION_LEN];
    let mut len = 0;
    for (i, slot) in bytes.iter_mut().enumerate() {
        let at = RealModeAddress::wrapping(cpu.cs, (ip + i as u32) & 0xFFFF);
        match bus.fetch(at) {
            Ok(byte) => {
                *slot = byte;
                len += 1;
            }
            // Short fetches are fine as long as the instruction fits.
            Err(err) if i == 0 => return Err(err),
            Err(_) => break,
        }
    }

    let mut decoder = Decoder::with_ip(16, &bytes[..len], ip as u64, DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.is_invalid() {
        return Err(BackendError::InvalidOpcode { cs: cpu.cs, ip });
    }
    let prefixes = Prefixes::scan(&bytes[..instr.len()]);

    let start_cs = cpu.cs;
    cpu.eip = (ip + instr.len() as u32) & 0xFFFF;

    let mut exec = Exec {
        cpu,
        bus,
        instr: &instr,
        prefixes,
        start_cs,
        start_ip: ip,
    };
    exec.execute()
}

/// Real-mode interrupt entry: push FLAGS, CS and IP, mask interrupts and
/// tracing, then load the vector from the IVT.
pub(crate) fn deliver_interrupt<B: Bus>(
    cpu: &mut CpuState,
    bus: &mut B,
    vector: u8,
    return_ip: u32,
) -> Result<(), BackendError> {
    for word in [cpu.eflags, cpu.cs as u32, return_ip] {
        let sp = cpu.sp().wrapping_sub(2);
        cpu.set_sp(sp);
        bus.write(RealModeAddress::wrapping(cpu.ss, sp as u32), 2, word & 0xFFFF)?;
    }
    cpu.eflags &= !(FLAG_IF | FLAG_TF);
    let entry = vector as u32 * 4;
    cpu.eip = bus.read(RealModeAddress::wrapping(0, entry), 2)?;
    cpu.cs = bus.read(RealModeAddress::wrapping(0, entry + 2), 2)? as u16;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
struct Prefixes {
    op32: bool,
    addr32: bool,
}

impl Prefixes {
    fn scan(bytes: &[u8]) -> Self {
        let mut prefixes = Self::default();
        for &b in bytes {
            match b {
                0x66 => prefixes.op32 = true,
                0x67 => prefixes.addr32 = true,
                0xF0 | 0xF2 | 0xF3 | 0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 => {}
                _ => break,
            }
        }
        prefixes
    }
}

/// Index, bit shift and width of a general-purpose register.
fn gpr_access(reg: Register) -> Option<(usize, u32, u32)> {
    use iced_x86::Register::*;
    let access = match reg {
        AL => (0, 0, 8),
        CL => (1, 0, 8),
        DL => (2, 0, 8),
        BL => (3, 0, 8),
        AH => (0, 8, 8),
        CH => (1, 8, 8),
        DH => (2, 8, 8),
        BH => (3, 8, 8),

        AX => (0, 0, 16),
        CX => (1, 0, 16),
        DX => (2, 0, 16),
        BX => (3, 0, 16),
        SP => (4, 0, 16),
        BP => (5, 0, 16),
        SI => (6, 0, 16),
        DI => (7, 0, 16),

        EAX => (0, 0, 32),
        ECX => (1, 0, 32),
        EDX => (2, 0, 32),
        EBX => (3, 0, 32),
        ESP => (4, 0, 32),
        EBP => (5, 0, 32),
        ESI => (6, 0, 32),
        EDI => (7, 0, 32),

        _ => return Option::None,
    };
    Some(access)
}

fn gpr_mut(cpu: &mut CpuState, idx: usize) -> &mut u32 {
    match idx {
        0 => &mut cpu.eax,
        1 => &mut cpu.ecx,
        2 => &mut cpu.edx,
        3 => &mut cpu.ebx,
        4 => &mut cpu.esp,
        5 => &mut cpu.ebp,
        6 => &mut cpu.esi,
        _ => &mut cpu.edi,
    }
}

fn segment_mut(cpu: &mut CpuState, reg: Register) -> Option<&mut u16> {
    Some(match reg {
        Register::ES => &mut cpu.es,
        Register::CS => &mut cpu.cs,
        Register::SS => &mut cpu.ss,
        Register::DS => &mut cpu.ds,
        Register::FS => &mut cpu.fs,
        Register::GS => &mut cpu.gs,
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

struct Exec<'a, B> {
    cpu: &'a mut CpuState,
    bus: &'a mut B,
    instr: &'a Instruction,
    prefixes: Prefixes,
    start_cs: u16,
    start_ip: u32,
}

impl<B: Bus> Exec<'_, B> {
    fn unsupported(&self) -> BackendError {
        BackendError::UnsupportedInstruction {
            cs: self.start_cs,
            ip: self.start_ip,
            mnemonic: format!("{:?}", self.instr.mnemonic()).to_lowercase(),
        }
    }

    fn op_size(&self) -> u32 {
        if self.prefixes.op32 {
            4
        } else {
            2
        }
    }

    /// PUSH/POP move a full operand-size slot, segment registers included.
    fn stack_operand_size(&self) -> u32 {
        if self.instr.op_kind(0) == OpKind::Register
            && self.instr.op_register(0).is_segment_register()
        {
            self.op_size()
        } else {
            self.operand_size(0)
        }
    }

    fn read_reg(&mut self, reg: Register) -> Result<u32, BackendError> {
        if let Some(seg) = segment_mut(self.cpu, reg) {
            return Ok(*seg as u32);
        }
        let (idx, shift, bits) = gpr_access(reg).ok_or_else(|| self.unsupported())?;
        let value = *gpr_mut(self.cpu, idx) >> shift;
        Ok(if bits == 32 {
            value
        } else {
            value & ((1 << bits) - 1)
        })
    }

    fn write_reg(&mut self, reg: Register, value: u32) -> Result<(), BackendError> {
        if let Some(seg) = segment_mut(self.cpu, reg) {
            *seg = value as u16;
            return Ok(());
        }
        let (idx, shift, bits) = gpr_access(reg).ok_or_else(|| self.unsupported())?;
        let slot = gpr_mut(self.cpu, idx);
        if bits == 32 {
            *slot = value;
        } else {
            let m = ((1u32 << bits) - 1) << shift;
            *slot = (*slot & !m) | ((value << shift) & m);
        }
        Ok(())
    }

    fn segment(&mut self, reg: Register) -> Result<u16, BackendError> {
        Ok(self.read_reg(reg)? as u16)
    }

    fn effective_offset(&mut self) -> Result<u32, BackendError> {
        let mut offset = self.instr.memory_displacement32();
        let base = self.instr.memory_base();
        if base != Register::None {
            offset = offset.wrapping_add(self.read_reg(base)?);
        }
        let index = self.instr.memory_index();
        if index != Register::None {
            let scaled = self
                .read_reg(index)?
                .wrapping_mul(self.instr.memory_index_scale());
            offset = offset.wrapping_add(scaled);
        }
        Ok(if self.prefixes.addr32 {
            offset
        } else {
            offset & 0xFFFF
        })
    }

    fn memory_address(&mut self) -> Result<RealModeAddress, BackendError> {
        let seg = self.segment(self.instr.memory_segment())?;
        let offset = self.effective_offset()?;
        Ok(RealModeAddress::wrapping(seg, offset))
    }

    fn operand_size(&self, i: u32) -> u32 {
        match self.instr.op_kind(i) {
            OpKind::Register => self.instr.op_register(i).size() as u32,
            OpKind::Memory => self.instr.memory_size().size() as u32,
            OpKind::Immediate8 => 1,
            OpKind::Immediate16 | OpKind::Immediate8to16 => 2,
            OpKind::Immediate32 | OpKind::Immediate8to32 => 4,
            _ => self.op_size(),
        }
    }

    fn read_op(&mut self, i: u32, size: u32) -> Result<u32, BackendError> {
        match self.instr.op_kind(i) {
            OpKind::Register => self.read_reg(self.instr.op_register(i)),
            OpKind::Memory => {
                let addr = self.memory_address()?;
                self.bus.read(addr, size)
            }
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32 => Ok(self.instr.immediate(i) as u32 & mask(size)),
            _ => Err(self.unsupported()),
        }
    }

    fn write_op(&mut self, i: u32, size: u32, value: u32) -> Result<(), BackendError> {
        match self.instr.op_kind(i) {
            OpKind::Register => self.write_reg(self.instr.op_register(i), value & mask(size)),
            OpKind::Memory => {
                let addr = self.memory_address()?;
                self.bus.write(addr, size, value)
            }
            _ => Err(self.unsupported()),
        }
    }

    fn set_arith(&mut self, flags: u32, affected: u32) {
        self.cpu.eflags = alu::merge(self.cpu.eflags, flags, affected);
    }

    fn flag(&self, flag: u32) -> bool {
        self.cpu.flag(flag)
    }

    fn condition(&self, cc: ConditionCode) -> bool {
        let cf = self.flag(FLAG_CF);
        let zf = self.flag(FLAG_ZF);
        let sf = self.flag(FLAG_SF);
        let of = self.flag(FLAG_OF);
        let pf = self.flag(FLAG_PF);
        match cc {
            ConditionCode::None => true,
            ConditionCode::o => of,
            ConditionCode::no => !of,
            ConditionCode::b => cf,
            ConditionCode::ae => !cf,
            ConditionCode::e => zf,
            ConditionCode::ne => !zf,
            ConditionCode::be => cf || zf,
            ConditionCode::a => !cf && !zf,
            ConditionCode::s => sf,
            ConditionCode::ns => !sf,
            ConditionCode::p => pf,
            ConditionCode::np => !pf,
            ConditionCode::l => sf != of,
            ConditionCode::ge => sf == of,
            ConditionCode::le => zf || sf != of,
            ConditionCode::g => !zf && sf == of,
        }
    }

    fn push(&mut self, size: u32, value: u32) -> Result<(), BackendError> {
        let sp = self.cpu.sp().wrapping_sub(size as u16);
        self.cpu.set_sp(sp);
        let addr = RealModeAddress::wrapping(self.cpu.ss, sp as u32);
        self.bus.write(addr, size, value)
    }

    fn pop(&mut self, size: u32) -> Result<u32, BackendError> {
        let sp = self.cpu.sp();
        let value = self
            .bus
            .read(RealModeAddress::wrapping(self.cpu.ss, sp as u32), size)?;
        self.cpu.set_sp(sp.wrapping_add(size as u16));
        Ok(value)
    }

    fn jump_near(&mut self, target: u32) {
        self.cpu.eip = target & mask(self.op_size());
    }

    fn branch_target(&self) -> u32 {
        self.instr.near_branch_target() as u32
    }

    fn interrupt(&mut self, vector: u8, return_ip: u32) -> Result<(), BackendError> {
        deliver_interrupt(self.cpu, self.bus, vector, return_ip)
    }

    /// Faulting instructions re-execute after the handler returns.
    fn divide_error(&mut self) -> Result<(), BackendError> {
        self.interrupt(VECTOR_DIVIDE_ERROR, self.start_ip)
    }

    fn load_flags(&mut self, value: u32, size: u32) {
        let writable = if size == 4 { POPF_MASK_32 } else { POPF_MASK_16 };
        self.cpu.eflags = alu::merge(self.cpu.eflags, value, writable) | crate::state::FLAG_RESERVED;
    }

    fn execute(&mut self) -> Result<StepExit, BackendError> {
        use Mnemonic as M;

        let mnemonic = self.instr.mnemonic();
        match mnemonic {
            M::Nop | M::Wait | M::Pause => {}

            M::Mov => {
                let size = self.operand_size(0);
                let value = self.read_op(1, size)?;
                self.write_op(0, size, value)?;
            }
            M::Movzx | M::Movsx => {
                let dst = self.operand_size(0);
                let src = self.operand_size(1);
                let mut value = self.read_op(1, src)?;
                if mnemonic == M::Movsx {
                    value = sign_extend(value, src) as u32;
                }
                self.write_op(0, dst, value & mask(dst))?;
            }
            M::Lea => {
                let size = self.operand_size(0);
                let offset = self.effective_offset()?;
                self.write_op(0, size, offset)?;
            }
            M::Xchg => {
                let size = self.operand_size(0);
                let a = self.read_op(0, size)?;
                let b = self.read_op(1, size)?;
                self.write_op(0, size, b)?;
                self.write_op(1, size, a)?;
            }
            M::Xadd => {
                let size = self.operand_size(0);
                let a = self.read_op(0, size)?;
                let b = self.read_op(1, size)?;
                let (r, flags) = alu::add(size, a, b, false);
                self.write_op(1, size, a)?;
                self.write_op(0, size, r)?;
                self.set_arith(flags, alu::ALL);
            }
            M::Bswap => {
                let value = self.read_op(0, 4)?;
                self.write_op(0, 4, value.swap_bytes())?;
            }

            M::Add | M::Adc | M::Sub | M::Sbb | M::Cmp | M::And | M::Or | M::Xor | M::Test => {
                self.binary_alu(mnemonic)?;
            }
            M::Inc | M::Dec => {
                let size = self.operand_size(0);
                let a = self.read_op(0, size)?;
                let (r, flags) = if mnemonic == M::Inc {
                    alu::add(size, a, 1, false)
                } else {
                    alu::sub(size, a, 1, false)
                };
                self.write_op(0, size, r)?;
                self.set_arith(flags, alu::ALL & !FLAG_CF);
            }
            M::Neg => {
                let size = self.operand_size(0);
                let a = self.read_op(0, size)?;
                let (r, flags) = alu::sub(size, 0, a, false);
                self.write_op(0, size, r)?;
                self.set_arith(flags, alu::ALL);
            }
            M::Not => {
                let size = self.operand_size(0);
                let a = self.read_op(0, size)?;
                self.write_op(0, size, !a & mask(size))?;
            }
            M::Mul | M::Imul if self.instr.op_count() == 1 => self.widening_multiply(mnemonic)?,
            M::Imul => self.truncating_multiply()?,
            M::Div | M::Idiv => self.divide(mnemonic)?,

            M::Shl | M::Sal | M::Shr | M::Sar => self.shift(mnemonic)?,
            M::Rol | M::Ror | M::Rcl | M::Rcr => self.rotate(mnemonic)?,
            M::Shld | M::Shrd => self.double_shift(mnemonic)?,
            M::Bt | M::Bts | M::Btr | M::Btc => self.bit_test(mnemonic)?,
            M::Bsf | M::Bsr => {
                let size = self.operand_size(0);
                let src = self.read_op(1, size)? & mask(size);
                if src == 0 {
                    self.cpu.set_flag(FLAG_ZF, true);
                } else {
                    let index = if mnemonic == M::Bsf {
                        src.trailing_zeros()
                    } else {
                        31 - src.leading_zeros()
                    };
                    self.write_op(0, size, index)?;
                    self.cpu.set_flag(FLAG_ZF, false);
                }
            }

            M::Cbw => {
                let al = self.cpu.al() as i8 as i16 as u16;
                self.cpu.set_ax(al);
            }
            M::Cwde => self.cpu.eax = self.cpu.ax() as i16 as i32 as u32,
            M::Cwd => {
                let dx = if self.cpu.ax() & 0x8000 != 0 { 0xFFFF } else { 0 };
                self.cpu.set_dx(dx);
            }
            M::Cdq => self.cpu.edx = if self.cpu.eax & 0x8000_0000 != 0 { u32::MAX } else { 0 },
            M::Lahf => {
                let flags = (self.cpu.eflags & 0xFF) as u8 | 0x02;
                self.cpu.set_ah(flags);
            }
            M::Sahf => {
                let ah = self.cpu.ah() as u32;
                let affected = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF;
                self.set_arith(ah, affected);
            }
            M::Aam => {
                let base = self.instr.immediate8() as u32;
                if base == 0 {
                    self.divide_error()?;
                } else {
                    let al = self.cpu.al() as u32;
                    self.cpu.set_ah((al / base) as u8);
                    self.cpu.set_al((al % base) as u8);
                    let flags = alu::szp(1, al % base);
                    self.set_arith(flags, alu::ALL);
                }
            }
            M::Aad => {
                let base = self.instr.immediate8() as u32;
                let al = (self.cpu.al() as u32 + self.cpu.ah() as u32 * base) & 0xFF;
                self.cpu.set_ax(al as u16);
                self.set_arith(alu::szp(1, al), alu::ALL);
            }

            M::Daa | M::Das => {
                let (al, flags) = alu::decimal_adjust(
                    self.cpu.al(),
                    self.flag(FLAG_CF),
                    self.flag(FLAG_AF),
                    mnemonic == M::Das,
                );
                self.cpu.set_al(al);
                self.set_arith(flags, alu::ALL);
            }
            M::Aaa | M::Aas => {
                let (ax, flags) =
                    alu::ascii_adjust(self.cpu.ax(), self.flag(FLAG_AF), mnemonic == M::Aas);
                self.cpu.set_ax(ax);
                self.set_arith(flags, FLAG_AF | FLAG_CF);
            }

            M::Cpuid => {
                let [eax, ebx, ecx, edx] = cpuid(self.cpu.eax);
                self.cpu.eax = eax;
                self.cpu.ebx = ebx;
                self.cpu.ecx = ecx;
                self.cpu.edx = edx;
            }
            M::Rdtsc => {
                let tsc = timestamp();
                self.cpu.eax = tsc as u32;
                self.cpu.edx = (tsc >> 32) as u32;
            }
            // No caches to write back.
            M::Wbinvd | M::Invd => {}

            M::Clc => self.cpu.set_flag(FLAG_CF, false),
            M::Stc => self.cpu.set_flag(FLAG_CF, true),
            M::Cmc => {
                let cf = self.flag(FLAG_CF);
                self.cpu.set_flag(FLAG_CF, !cf);
            }
            M::Cld => self.cpu.set_flag(FLAG_DF, false),
            M::Std => self.cpu.set_flag(FLAG_DF, true),
            M::Cli => self.cpu.set_flag(FLAG_IF, false),
            M::Sti => self.cpu.set_flag(FLAG_IF, true),

            M::Push => {
                let size = self.stack_operand_size();
                let value = self.read_op(0, size)?;
                self.push(size, value)?;
            }
            M::Pop => {
                let size = self.stack_operand_size();
                if self.instr.op_kind(0) == OpKind::Register
                    && self.instr.op_register(0) == Register::CS
                {
                    return Err(self.unsupported());
                }
                let value = self.pop(size)?;
                self.write_op(0, size, value)?;
            }
            M::Pusha | M::Pushad => {
                let size = if mnemonic == M::Pushad { 4 } else { 2 };
                let sp = self.cpu.esp;
                for value in [
                    self.cpu.eax,
                    self.cpu.ecx,
                    self.cpu.edx,
                    self.cpu.ebx,
                    sp,
                    self.cpu.ebp,
                    self.cpu.esi,
                    self.cpu.edi,
                ] {
                    self.push(size, value & mask(size))?;
                }
            }
            M::Popa | M::Popad => {
                let size = if mnemonic == M::Popad { 4 } else { 2 };
                for idx in [7usize, 6, 5, 4, 3, 2, 1, 0] {
                    let value = self.pop(size)?;
                    if idx == 4 {
                        continue;
                    }
                    let slot = gpr_mut(self.cpu, idx);
                    *slot = if size == 4 {
                        value
                    } else {
                        (*slot & !0xFFFF) | value
                    };
                }
            }
            M::Pushf | M::Pushfd => {
                let size = if mnemonic == M::Pushfd { 4 } else { 2 };
                self.push(size, self.cpu.eflags & mask(size))?;
            }
            M::Popf | M::Popfd => {
                let size = if mnemonic == M::Popfd { 4 } else { 2 };
                let value = self.pop(size)?;
                self.load_flags(value, size);
            }
            M::Enter => {
                let frame = self.instr.immediate16() as u32;
                let level = self.instr.immediate8_2nd() & 0x1F;
                if level != 0 {
                    return Err(self.unsupported());
                }
                let size = self.op_size();
                let bp = self.cpu.ebp;
                self.push(size, bp & mask(size))?;
                let sp = self.cpu.sp();
                if size == 4 {
                    self.cpu.ebp = sp as u32;
                } else {
                    self.cpu.set_bp(sp);
                }
                self.cpu.set_sp(sp.wrapping_sub(frame as u16));
            }
            M::Leave => {
                let bp = self.cpu.bp();
                self.cpu.set_sp(bp);
                let size = self.op_size();
                let value = self.pop(size)?;
                if size == 4 {
                    self.cpu.ebp = value;
                } else {
                    self.cpu.set_bp(value as u16);
                }
            }

            M::Jmp => self.jump()?,
            M::Call => self.call()?,
            M::Ret => {
                let size = self.op_size();
                let ip = self.pop(size)?;
                self.release_stack();
                self.jump_near(ip);
            }
            M::Retf => {
                let size = self.op_size();
                let ip = self.pop(size)?;
                let cs = self.pop(size)?;
                self.release_stack();
                self.cpu.cs = cs as u16;
                self.jump_near(ip);
            }
            M::Iret | M::Iretd => {
                let size = if mnemonic == M::Iretd { 4 } else { 2 };
                let ip = self.pop(size)?;
                let cs = self.pop(size)?;
                let flags = self.pop(size)?;
                self.cpu.cs = cs as u16;
                self.cpu.eip = ip & mask(size);
                self.load_flags(flags, size);
            }
            M::Int => {
                let vector = self.instr.immediate8();
                self.interrupt(vector, self.cpu.eip)?;
            }
            M::Int3 => self.interrupt(VECTOR_BREAKPOINT, self.cpu.eip)?,
            M::Into => {
                if self.flag(FLAG_OF) {
                    self.interrupt(VECTOR_OVERFLOW, self.cpu.eip)?;
                }
            }
            M::Hlt => {
                return Ok(StepExit::Halted {
                    cs: self.start_cs,
                    ip: self.start_ip,
                })
            }

            M::Loop | M::Loope | M::Loopne => {
                let count = self.decrement_counter();
                let zf = self.flag(FLAG_ZF);
                let taken = count != 0
                    && match mnemonic {
                        M::Loope => zf,
                        M::Loopne => !zf,
                        _ => true,
                    };
                if taken {
                    let target = self.branch_target();
                    self.jump_near(target);
                }
            }
            M::Jcxz | M::Jecxz => {
                let count = if mnemonic == M::Jecxz {
                    self.cpu.ecx
                } else {
                    self.cpu.cx() as u32
                };
                if count == 0 {
                    let target = self.branch_target();
                    self.jump_near(target);
                }
            }
            _ if self.instr.is_jcc_short_or_near() => {
                if self.condition(self.instr.condition_code()) {
                    let target = self.branch_target();
                    self.jump_near(target);
                }
            }
            M::Seto | M::Setno | M::Setb | M::Setae | M::Sete | M::Setne | M::Setbe | M::Seta
            | M::Sets | M::Setns | M::Setp | M::Setnp | M::Setl | M::Setge | M::Setle
            | M::Setg => {
                let value = self.condition(self.instr.condition_code()) as u32;
                self.write_op(0, 1, value)?;
            }
            M::Cmovo | M::Cmovno | M::Cmovb | M::Cmovae | M::Cmove | M::Cmovne | M::Cmovbe
            | M::Cmova | M::Cmovs | M::Cmovns | M::Cmovp | M::Cmovnp | M::Cmovl | M::Cmovge
            | M::Cmovle | M::Cmovg => {
                if self.condition(self.instr.condition_code()) {
                    let size = self.operand_size(0);
                    let value = self.read_op(1, size)?;
                    self.write_op(0, size, value)?;
                }
            }

            M::In => {
                let size = self.operand_size(0);
                let port = self.read_op(1, 2)? as u16;
                let value = self.bus.io_read(port, size);
                self.write_op(0, size, value)?;
            }
            M::Out => {
                let size = self.operand_size(1);
                let port = self.read_op(0, 2)? as u16;
                let value = self.read_op(1, size)?;
                self.bus.io_write(port, size, value);
            }

            M::Movsb | M::Movsw | M::Movsd => self.string(StringOp::Movs, mnemonic)?,
            M::Cmpsb | M::Cmpsw | M::Cmpsd => self.string(StringOp::Cmps, mnemonic)?,
            M::Stosb | M::Stosw | M::Stosd => self.string(StringOp::Stos, mnemonic)?,
            M::Lodsb | M::Lodsw | M::Lodsd => self.string(StringOp::Lods, mnemonic)?,
            M::Scasb | M::Scasw | M::Scasd => self.string(StringOp::Scas, mnemonic)?,
            M::Insb | M::Insw | M::Insd => self.string(StringOp::Ins, mnemonic)?,
            M::Outsb | M::Outsw | M::Outsd => self.string(StringOp::Outs, mnemonic)?,

            M::Xlatb => {
                let seg = self.segment(self.instr.memory_segment())?;
                let base = if self.prefixes.addr32 {
                    self.cpu.ebx
                } else {
                    self.cpu.bx() as u32
                };
                let offset = base.wrapping_add(self.cpu.al() as u32);
                let offset = if self.prefixes.addr32 { offset } else { offset & 0xFFFF };
                let value = self.bus.read(RealModeAddress::wrapping(seg, offset), 1)?;
                self.cpu.set_al(value as u8);
            }
            M::Lds | M::Les | M::Lfs | M::Lgs | M::Lss => {
                let size = self.operand_size(0);
                let addr = self.memory_address()?;
                let offset = self.bus.read(addr, size)?;
                let selector = self.bus.read(byte_addr(addr, size), 2)?;
                self.write_op(0, size, offset)?;
                let seg = match mnemonic {
                    M::Lds => Register::DS,
                    M::Les => Register::ES,
                    M::Lfs => Register::FS,
                    M::Lgs => Register::GS,
                    _ => Register::SS,
                };
                self.write_reg(seg, selector)?;
            }

            _ => return Err(self.unsupported()),
        }
        Ok(StepExit::Continue)
    }

    /// `RET imm16` / `RETF imm16` release parameter bytes after the pop.
    fn release_stack(&mut self) {
        if self.instr.op_count() == 1 {
            let bytes = self.instr.immediate16();
            let sp = self.cpu.sp().wrapping_add(bytes);
            self.cpu.set_sp(sp);
        }
    }

    fn decrement_counter(&mut self) -> u32 {
        if self.prefixes.addr32 {
            self.cpu.ecx = self.cpu.ecx.wrapping_sub(1);
            self.cpu.ecx
        } else {
            let cx = self.cpu.cx().wrapping_sub(1);
            self.cpu.set_cx(cx);
            cx as u32
        }
    }

    fn binary_alu(&mut self, mnemonic: Mnemonic) -> Result<(), BackendError> {
        use Mnemonic as M;

        let size = self.operand_size(0);
        let a = self.read_op(0, size)?;
        let b = self.read_op(1, size)?;
        let cf = self.flag(FLAG_CF);
        let (r, flags) = match mnemonic {
            M::Add => alu::add(size, a, b, false),
            M::Adc => alu::add(size, a, b, cf),
            M::Sub | M::Cmp => alu::sub(size, a, b, false),
            M::Sbb => alu::sub(size, a, b, cf),
            M::And | M::Test => alu::logic(size, a & b),
            M::Or => alu::logic(size, a | b),
            _ => alu::logic(size, a ^ b),
        };
        if !matches!(mnemonic, M::Cmp | M::Test) {
            self.write_op(0, size, r)?;
        }
        self.set_arith(flags, alu::ALL);
        Ok(())
    }

    fn widening_multiply(&mut self, mnemonic: Mnemonic) -> Result<(), BackendError> {
        let size = self.operand_size(0);
        let src = self.read_op(0, size)?;
        let signed = mnemonic == Mnemonic::Imul;
        let acc = self.cpu.eax & mask(size);

        let product: i64 = if signed {
            sign_extend(acc, size) * sign_extend(src, size)
        } else {
            acc as i64 * src as i64
        };
        let low = product as u32 & mask(size);
        let overflow = if signed {
            sign_extend(low, size) != product
        } else {
            (product as u64) >> (size * 8) != 0
        };
        let high = ((product as u64) >> (size * 8)) as u32 & mask(size);

        match size {
            1 => self.cpu.set_ax(product as u16),
            2 => {
                self.cpu.set_ax(low as u16);
                self.cpu.set_dx(high as u16);
            }
            _ => {
                self.cpu.eax = low;
                self.cpu.edx = high;
            }
        }
        let mut flags = alu::szp(size, low);
        if overflow {
            flags |= FLAG_CF | FLAG_OF;
        }
        self.set_arith(flags, alu::ALL);
        Ok(())
    }

    fn truncating_multiply(&mut self) -> Result<(), BackendError> {
        let size = self.operand_size(0);
        let (a, b) = if self.instr.op_count() == 3 {
            (self.read_op(1, size)?, self.read_op(2, size)?)
        } else {
            (self.read_op(0, size)?, self.read_op(1, size)?)
        };
        let product = sign_extend(a, size) * sign_extend(b, size);
        let r = product as u32 & mask(size);
        self.write_op(0, size, r)?;
        let mut flags = alu::szp(size, r);
        if sign_extend(r, size) != product {
            flags |= FLAG_CF | FLAG_OF;
        }
        self.set_arith(flags, alu::ALL);
        Ok(())
    }

    fn divide(&mut self, mnemonic: Mnemonic) -> Result<(), BackendError> {
        let size = self.operand_size(0);
        let divisor = self.read_op(0, size)? & mask(size);
        if divisor == 0 {
            return self.divide_error();
        }
        let bits = size * 8;
        let dividend: u64 = match size {
            1 => self.cpu.ax() as u64,
            2 => ((self.cpu.dx() as u64) << 16) | self.cpu.ax() as u64,
            _ => ((self.cpu.edx as u64) << 32) | self.cpu.eax as u64,
        };

        let (quotient, remainder) = if mnemonic == Mnemonic::Idiv {
            let dividend = match size {
                1 => dividend as u16 as i16 as i64,
                2 => dividend as u32 as i32 as i64,
                _ => dividend as i64,
            };
            let divisor = sign_extend(divisor, size);
            let (q, r) = match (dividend.checked_div(divisor), dividend.checked_rem(divisor)) {
                (Some(q), Some(r)) => (q, r),
                _ => return self.divide_error(),
            };
            let limit = 1i64 << (bits - 1);
            if q >= limit || q < -limit {
                return self.divide_error();
            }
            (q as u32 & mask(size), r as u32 & mask(size))
        } else {
            let q = dividend / divisor as u64;
            if q >> bits != 0 {
                return self.divide_error();
            }
            (q as u32, (dividend % divisor as u64) as u32)
        };

        match size {
            1 => {
                self.cpu.set_al(quotient as u8);
                self.cpu.set_ah(remainder as u8);
            }
            2 => {
                self.cpu.set_ax(quotient as u16);
                self.cpu.set_dx(remainder as u16);
            }
            _ => {
                self.cpu.eax = quotient;
                self.cpu.edx = remainder;
            }
        }
        Ok(())
    }

    fn shift_count(&mut self) -> Result<u32, BackendError> {
        Ok(if self.instr.op_count() < 2 {
            1
        } else {
            self.read_op(1, 1)? & 0x1F
        })
    }

    fn shift(&mut self, mnemonic: Mnemonic) -> Result<(), BackendError> {
        let size = self.operand_size(0);
        let count = self.shift_count()?;
        if count == 0 {
            return Ok(());
        }
        let bits = size * 8;
        let a = self.read_op(0, size)? & mask(size);
        let wide = a as u64;

        let (r, cf, of) = match mnemonic {
            Mnemonic::Shr => {
                let r = (wide >> count) as u32;
                let cf = (wide >> (count - 1)) & 1 != 0;
                (r, cf, a & sign_bit(size) != 0)
            }
            Mnemonic::Sar => {
                let signed = sign_extend(a, size);
                let r = (signed >> count) as u32 & mask(size);
                let cf = (signed >> (count - 1)) & 1 != 0;
                (r, cf, false)
            }
            _ => {
                let r = (wide << count) as u32 & mask(size);
                let cf = count <= bits && (wide >> (bits - count)) & 1 != 0;
                (r, cf, (r & sign_bit(size) != 0) != cf)
            }
        };

        self.write_op(0, size, r)?;
        let mut flags = alu::szp(size, r);
        if cf {
            flags |= FLAG_CF;
        }
        if of {
            flags |= FLAG_OF;
        }
        self.set_arith(flags, alu::ALL);
        Ok(())
    }

    fn rotate(&mut self, mnemonic: Mnemonic) -> Result<(), BackendError> {
        let size = self.operand_size(0);
        let count = self.shift_count()?;
        if count == 0 {
            return Ok(());
        }
        let bits = size * 8;
        let a = self.read_op(0, size)? & mask(size);
        let msb = |v: u32| v & sign_bit(size) != 0;
        let old_cf = self.flag(FLAG_CF);

        let (r, cf, of) = match mnemonic {
            Mnemonic::Rol => {
                let n = count % bits;
                let r = if n == 0 {
                    a
                } else {
                    ((a << n) | (a >> (bits - n))) & mask(size)
                };
                let cf = r & 1 != 0;
                (r, cf, msb(r) != cf)
            }
            Mnemonic::Ror => {
                let n = count % bits;
                let r = if n == 0 {
                    a
                } else {
                    ((a >> n) | (a << (bits - n))) & mask(size)
                };
                let cf = msb(r);
                (r, cf, msb(r) != (r & (sign_bit(size) >> 1) != 0))
            }
            Mnemonic::Rcl => {
                let width = bits + 1;
                let n = count % width;
                let v = ((old_cf as u64) << bits) | a as u64;
                let v = rotate_left_within(v, n, width);
                let r = v as u32 & mask(size);
                let cf = (v >> bits) & 1 != 0;
                (r, cf, msb(r) != cf)
            }
            _ => {
                let width = bits + 1;
                let n = count % width;
                let of = msb(a) != old_cf;
                let v = ((old_cf as u64) << bits) | a as u64;
                let v = rotate_left_within(v, (width - n) % width, width);
                let r = v as u32 & mask(size);
                (r, (v >> bits) & 1 != 0, of)
            }
        };

        self.write_op(0, size, r)?;
        self.cpu.set_flag(FLAG_CF, cf);
        self.cpu.set_flag(FLAG_OF, of);
        Ok(())
    }

    fn double_shift(&mut self, mnemonic: Mnemonic) -> Result<(), BackendError> {
        let size = self.operand_size(0);
        let bits = size * 8;
        let count = self.read_op(2, 1)? & 0x1F;
        if count == 0 || count > bits {
            return Ok(());
        }
        let dst = self.read_op(0, size)? as u64 & mask(size) as u64;
        let src = self.read_op(1, size)? as u64 & mask(size) as u64;

        let (r, cf) = if mnemonic == Mnemonic::Shld {
            let combined = (dst << bits) | src;
            let r = (combined << count) >> bits;
            (r as u32 & mask(size), (dst >> (bits - count)) & 1 != 0)
        } else {
            let combined = (src << bits) | dst;
            let r = combined >> count;
            (r as u32 & mask(size), (dst >> (count - 1)) & 1 != 0)
        };

        self.write_op(0, size, r)?;
        let mut flags = alu::szp(size, r);
        if cf {
            flags |= FLAG_CF;
        }
        if ((r ^ dst as u32) & sign_bit(size)) != 0 {
            flags |= FLAG_OF;
        }
        self.set_arith(flags, alu::ALL);
        Ok(())
    }

    fn bit_test(&mut self, mnemonic: Mnemonic) -> Result<(), BackendError> {
        let size = self.operand_size(0);
        let bits = size * 8;
        let offset_is_register = self.instr.op_kind(1) == OpKind::Register;
        let raw = self.read_op(1, size)?;

        let (addr, bit) = if self.instr.op_kind(0) == OpKind::Memory && offset_is_register {
            // Register offsets address a bit string relative to the operand.
            let signed = sign_extend(raw, size);
            let element = signed.div_euclid(bits as i64);
            let base = self.memory_address()?;
            let linear = (base.linear() as i64 + element * size as i64) as u32;
            (
                Some(RealModeAddress::wrapping(0, linear)),
                signed.rem_euclid(bits as i64) as u32,
            )
        } else if self.instr.op_kind(0) == OpKind::Memory {
            (Some(self.memory_address()?), raw & (bits - 1))
        } else {
            (None, raw & (bits - 1))
        };

        let value = match addr {
            Some(addr) => self.bus.read(addr, size)?,
            None => self.read_op(0, size)?,
        };
        let set = value & (1 << bit) != 0;
        self.cpu.set_flag(FLAG_CF, set);

        let updated = match mnemonic {
            Mnemonic::Bts => value | (1 << bit),
            Mnemonic::Btr => value & !(1 << bit),
            Mnemonic::Btc => value ^ (1 << bit),
            _ => return Ok(()),
        };
        match addr {
            Some(addr) => self.bus.write(addr, size, updated),
            None => self.write_op(0, size, updated),
        }
    }

    fn jump(&mut self) -> Result<(), BackendError> {
        match self.instr.op_kind(0) {
            OpKind::NearBranch16 | OpKind::NearBranch32 => {
                let target = self.branch_target();
                self.jump_near(target);
            }
            OpKind::FarBranch16 | OpKind::FarBranch32 => {
                self.cpu.cs = self.instr.far_branch_selector();
                self.cpu.eip = self.far_branch_offset();
            }
            OpKind::Memory if self.is_far_pointer() => {
                let (cs, ip) = self.read_far_pointer()?;
                self.cpu.cs = cs;
                self.cpu.eip = ip;
            }
            _ => {
                let size = self.operand_size(0);
                let target = self.read_op(0, size)?;
                self.jump_near(target);
            }
        }
        Ok(())
    }

    fn call(&mut self) -> Result<(), BackendError> {
        let size = self.op_size();
        let return_ip = self.cpu.eip;
        match self.instr.op_kind(0) {
            OpKind::NearBranch16 | OpKind::NearBranch32 => {
                let target = self.branch_target();
                self.push(size, return_ip)?;
                self.jump_near(target);
            }
            OpKind::FarBranch16 | OpKind::FarBranch32 => {
                let cs = self.instr.far_branch_selector();
                let ip = self.far_branch_offset();
                self.push(size, self.cpu.cs as u32)?;
                self.push(size, return_ip)?;
                self.cpu.cs = cs;
                self.cpu.eip = ip;
            }
            OpKind::Memory if self.is_far_pointer() => {
                let (cs, ip) = self.read_far_pointer()?;
                self.push(size, self.cpu.cs as u32)?;
                self.push(size, return_ip)?;
                self.cpu.cs = cs;
                self.cpu.eip = ip;
            }
            _ => {
                let target_size = self.operand_size(0);
                let target = self.read_op(0, target_size)?;
                self.push(size, return_ip)?;
                self.jump_near(target);
            }
        }
        Ok(())
    }

    fn far_branch_offset(&self) -> u32 {
        if self.instr.op_kind(0) == OpKind::FarBranch32 {
            self.instr.far_branch32()
        } else {
            self.instr.far_branch16() as u32
        }
    }

    fn is_far_pointer(&self) -> bool {
        matches!(
            self.instr.memory_size(),
            iced_x86::MemorySize::SegPtr16 | iced_x86::MemorySize::SegPtr32
        )
    }

    fn read_far_pointer(&mut self) -> Result<(u16, u32), BackendError> {
        let offset_size = if self.instr.memory_size() == iced_x86::MemorySize::SegPtr32 {
            4
        } else {
            2
        };
        let addr = self.memory_address()?;
        let ip = self.bus.read(addr, offset_size)?;
        let cs = self.bus.read(byte_addr(addr, offset_size), 2)? as u16;
        Ok((cs, ip))
    }

    fn string(&mut self, op: StringOp, mnemonic: Mnemonic) -> Result<(), BackendError> {
        use Mnemonic as M;

        // MOVSD/CMPSD also name SSE instructions.
        if self.instr.op_kind(0) == OpKind::Register && self.instr.op_register(0).is_xmm() {
            return Err(self.unsupported());
        }
        let size: u32 = match mnemonic {
            M::Movsb | M::Cmpsb | M::Stosb | M::Lodsb | M::Scasb | M::Insb | M::Outsb => 1,
            M::Movsw | M::Cmpsw | M::Stosw | M::Lodsw | M::Scasw | M::Insw | M::Outsw => 2,
            _ => 4,
        };
        let rep = self.instr.has_repe_prefix() || self.instr.has_repne_prefix();
        let src_seg = match op {
            StringOp::Movs | StringOp::Cmps | StringOp::Lods | StringOp::Outs => {
                self.segment(self.instr.memory_segment())?
            }
            _ => self.cpu.ds,
        };
        let index_mask = if self.prefixes.addr32 { u32::MAX } else { 0xFFFF };
        let step = if self.flag(FLAG_DF) {
            size.wrapping_neg()
        } else {
            size
        };

        loop {
            if rep && self.cpu.ecx & index_mask == 0 {
                break;
            }
            let si = self.cpu.esi & index_mask;
            let di = self.cpu.edi & index_mask;
            let src = RealModeAddress::wrapping(src_seg, si);
            let dst = RealModeAddress::wrapping(self.cpu.es, di);

            match op {
                StringOp::Movs => {
                    let value = self.bus.read(src, size)?;
                    self.bus.write(dst, size, value)?;
                }
                StringOp::Stos => {
                    let value = self.cpu.eax & mask(size);
                    self.bus.write(dst, size, value)?;
                }
                StringOp::Lods => {
                    let value = self.bus.read(src, size)?;
                    self.write_accumulator(size, value);
                }
                StringOp::Cmps => {
                    let a = self.bus.read(src, size)?;
                    let b = self.bus.read(dst, size)?;
                    let (_, flags) = alu::sub(size, a, b, false);
                    self.set_arith(flags, alu::ALL);
                }
                StringOp::Scas => {
                    let b = self.bus.read(dst, size)?;
                    let (_, flags) = alu::sub(size, self.cpu.eax, b, false);
                    self.set_arith(flags, alu::ALL);
                }
                StringOp::Ins => {
                    let value = self.bus.io_read(self.cpu.dx(), size);
                    self.bus.write(dst, size, value)?;
                }
                StringOp::Outs => {
                    let value = self.bus.read(src, size)?;
                    self.bus.io_write(self.cpu.dx(), size, value);
                }
            }

            if matches!(
                op,
                StringOp::Movs | StringOp::Cmps | StringOp::Lods | StringOp::Outs
            ) {
                self.advance_index(Register::ESI, step, index_mask);
            }
            if matches!(
                op,
                StringOp::Movs | StringOp::Cmps | StringOp::Stos | StringOp::Scas | StringOp::Ins
            ) {
                self.advance_index(Register::EDI, step, index_mask);
            }

            if !rep {
                break;
            }
            let count = (self.cpu.ecx & index_mask).wrapping_sub(1) & index_mask;
            self.cpu.ecx = (self.cpu.ecx & !index_mask) | count;
            if matches!(op, StringOp::Cmps | StringOp::Scas) {
                let zf = self.flag(FLAG_ZF);
                if (self.instr.has_repe_prefix() && !zf) || (self.instr.has_repne_prefix() && zf)
                {
                    break;
                }
            }
        }
        Ok(())
    }

    fn advance_index(&mut self, reg: Register, step: u32, index_mask: u32) {
        let slot = if reg == Register::ESI {
            &mut self.cpu.esi
        } else {
            &mut self.cpu.edi
        };
        let next = (*slot & index_mask).wrapping_add(step) & index_mask;
        *slot = (*slot & !index_mask) | next;
    }

    fn write_accumulator(&mut self, size: u32, value: u32) {
        match size {
            1 => self.cpu.set_al(value as u8),
            2 => self.cpu.set_ax(value as u16),
            _ => self.cpu.eax = value,
        }
    }
}

/// EAX, EBX, ECX and EDX reported for a CPUID leaf: an Intel 486 with
/// VME and nothing newer.
fn cpuid(leaf: u32) -> [u32; 4] {
    match leaf {
        // "GenuineIntel" in EBX, EDX, ECX order.
        0 => [1, 0x756E_6547, 0x6C65_746E, 0x4965_6E69],
        1 => [0x0000_0480, 0, 0, 0x0000_0002],
        _ => [0; 4],
    }
}

/// Nanoseconds since the first read, strictly increasing across reads.
fn timestamp() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64;
    match LAST.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
        Some(now.max(last + 1))
    }) {
        Ok(last) | Err(last) => now.max(last + 1),
    }
}

fn rotate_left_within(value: u64, n: u32, width: u32) -> u64 {
    let m = (1u64 << width) - 1;
    if n == 0 {
        return value & m;
    }
    ((value << n) | (value >> (width - n))) & m
}

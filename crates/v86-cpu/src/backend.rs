use core::{fmt, str::FromStr};

use tracing::trace;
use v86_mem::{RealModeAddress, RealModeMemory};

use crate::{
    state::{CpuState, DEFAULT_FLAGS, FLAG_IF, FLAG_TF},
    BackendError, EmulatorBackend, HostPorts, LibraryBackend, TrapBackend,
};

/// Size of the stack handed to BIOS code.
pub const STACK_SIZE: u32 = 0x2000;

const HLT: u8 = 0xF4;

/// Which execution strategy runs the BIOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Virtual-8086 mode through the kernel, on 32-bit x86 hosts.
    Trap,
    /// The external LRMI library.
    Library,
    /// The built-in x86 interpreter.
    Emulator,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Trap => "trap",
            BackendKind::Library => "lrmi",
            BackendKind::Emulator => "emulator",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trap" | "vm86" => Ok(BackendKind::Trap),
            "lrmi" | "library" => Ok(BackendKind::Library),
            "emulator" | "emu" | "x86emu" => Ok(BackendKind::Emulator),
            other => Err(format!(
                "unknown backend `{other}` (expected emulator, trap or lrmi)"
            )),
        }
    }
}

/// Runs one software interrupt's handler in real mode.
///
/// Backends are interchangeable: given the same register file, memory and
/// BIOS they must return the same register file.
pub trait ExecutionBackend {
    fn kind(&self) -> BackendKind;

    fn memory(&self) -> &dyn RealModeMemory;

    fn memory_mut(&mut self) -> &mut dyn RealModeMemory;

    /// Invokes the handler for `vector` with `regs` loaded and returns the
    /// register file observed when the handler returns.
    ///
    /// The stack, code segment and instruction pointer of `regs` are ignored;
    /// the backend supplies its own stack and return path.
    fn execute_interrupt(&mut self, vector: u8, regs: &CpuState) -> Result<CpuState, BackendError>;
}

/// Backend chosen at startup.
pub enum Backend {
    Trap(TrapBackend),
    Library(LibraryBackend),
    Emulator(EmulatorBackend<HostPorts>),
}

impl ExecutionBackend for Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Backend::Trap(b) => b.kind(),
            Backend::Library(b) => b.kind(),
            Backend::Emulator(b) => b.kind(),
        }
    }

    fn memory(&self) -> &dyn RealModeMemory {
        match self {
            Backend::Trap(b) => b.memory(),
            Backend::Library(b) => b.memory(),
            Backend::Emulator(b) => b.memory(),
        }
    }

    fn memory_mut(&mut self) -> &mut dyn RealModeMemory {
        match self {
            Backend::Trap(b) => b.memory_mut(),
            Backend::Library(b) => b.memory_mut(),
            Backend::Emulator(b) => b.memory_mut(),
        }
    }

    fn execute_interrupt(&mut self, vector: u8, regs: &CpuState) -> Result<CpuState, BackendError> {
        match self {
            Backend::Trap(b) => b.execute_interrupt(vector, regs),
            Backend::Library(b) => b.execute_interrupt(vector, regs),
            Backend::Emulator(b) => b.execute_interrupt(vector, regs),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.kind()).finish()
    }
}

/// Stack and return stub shared by the backends that drive the CPU state
/// themselves.
///
/// The stub is a single `HLT` in its own paragraph. Calls start with an
/// interrupt frame on the stack whose return address is the stub, so the
/// handler's `IRET` lands there and the backend stops.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallFrame {
    stack: RealModeAddress,
    halt: RealModeAddress,
}

impl CallFrame {
    pub(crate) fn install(memory: &mut dyn RealModeMemory) -> Result<Self, BackendError> {
        let stack = memory.alloc(STACK_SIZE)?;
        let halt = memory.alloc(1)?;
        memory.write_u8(halt, HLT)?;
        trace!(%stack, %halt, "installed call frame");
        Ok(Self { stack, halt })
    }

    pub(crate) fn halt(&self) -> RealModeAddress {
        self.halt
    }

    /// Whether `cs:ip` is the return stub.
    pub(crate) fn is_return(&self, cs: u16, ip: u32) -> bool {
        RealModeAddress::wrapping(cs, ip & 0xFFFF) == self.halt
    }

    /// Builds the register file at the first instruction of the handler
    /// for `vector`.
    pub(crate) fn enter(
        &self,
        memory: &mut dyn RealModeMemory,
        vector: u8,
        regs: &CpuState,
    ) -> Result<CpuState, BackendError> {
        let (stack_seg, _) = self.stack.to_seg_off();
        let (halt_seg, _) = self.halt.to_seg_off();

        let mut cpu = *regs;
        cpu.ss = stack_seg;
        cpu.esp = STACK_SIZE;
        cpu.eflags = DEFAULT_FLAGS;

        for word in [(DEFAULT_FLAGS | FLAG_IF) as u16, halt_seg, 0] {
            cpu.set_sp(cpu.sp().wrapping_sub(2));
            memory.write_u16(RealModeAddress::wrapping(cpu.ss, cpu.sp() as u32), word)?;
        }

        let vector_addr = RealModeAddress::wrapping(0, vector as u32 * 4);
        cpu.eip = memory.read_u16(vector_addr)? as u32;
        cpu.cs = memory.read_u16(RealModeAddress::wrapping(0, vector as u32 * 4 + 2))?;
        cpu.eflags &= !(FLAG_IF | FLAG_TF);
        Ok(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use v86_mem::{MemoryRegion, RegionKind, RegionMap};

    fn memory() -> RegionMap {
        RegionMap::default()
            .with(MemoryRegion::zeroed(RegionKind::IvtBda, RealModeAddress::ZERO, 0x1000))
            .unwrap()
            .with(MemoryRegion::zeroed(
                RegionKind::Scratch,
                RealModeAddress::new(0x10000).unwrap(),
                0x20000,
            ))
            .unwrap()
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("emulator".parse::<BackendKind>(), Ok(BackendKind::Emulator));
        assert_eq!("LRMI".parse::<BackendKind>(), Ok(BackendKind::Library));
        assert_eq!("vm86".parse::<BackendKind>(), Ok(BackendKind::Trap));
        assert!("qemu".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Library.to_string(), "lrmi");
    }

    #[test]
    fn enter_pushes_return_frame_and_loads_vector() {
        let mut mem = memory();
        mem.write_u32(RealModeAddress::new(0x40).unwrap(), 0xC000_1234).unwrap();
        let frame = CallFrame::install(&mut mem).unwrap();
        assert_eq!(mem.read_u8(frame.halt()).unwrap(), HLT);

        let regs = CpuState {
            eax: 0x4F00,
            ..Default::default()
        };
        let cpu = frame.enter(&mut mem, 0x10, &regs).unwrap();
        assert_eq!((cpu.cs, cpu.ip()), (0xC000, 0x1234));
        assert_eq!(cpu.eax, 0x4F00);
        assert_eq!(cpu.sp() as u32, STACK_SIZE - 6);
        assert!(!cpu.flag(FLAG_IF));

        let top = RealModeAddress::wrapping(cpu.ss, cpu.sp() as u32);
        let ip = mem.read_u16(top).unwrap();
        let cs = mem.read_u16(top.checked_add(2).unwrap()).unwrap();
        let flags = mem.read_u16(top.checked_add(4).unwrap()).unwrap();
        assert!(frame.is_return(cs, ip as u32));
        assert_eq!(flags as u32, DEFAULT_FLAGS | FLAG_IF);
    }
}

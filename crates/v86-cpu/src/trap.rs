//! Virtual-8086 mode backend.
//!
//! BIOS code runs natively in vm86 mode through the Linux `vm86(2)` call,
//! which only exists for 32-bit x86 processes. The kernel hands control back
//! whenever the code does something vm86 mode cannot do on its own: every
//! `INT n` (all vectors are revectored to us), privileged or I/O
//! instructions outside the granted port range, and the `HLT` of the return
//! stub. Interrupts are reflected through the real-mode IVT; other
//! instructions are single-stepped in the interpreter.

use tracing::debug;
use v86_mem::{RealModeMemory, RegionMap};

use crate::{
    backend::CallFrame, state::CpuState, BackendError, BackendKind, ExecutionBackend, HostPorts,
};

/// Runs BIOS code in virtual-8086 mode.
///
/// `memory` must be identity-mapped: each region's host mapping has to sit
/// at the same virtual address as its real-mode linear address, which
/// [`HostLayout`](v86_mem::HostLayout) arranges with
/// [`Placement::Identity`](v86_mem::Placement::Identity).
#[derive(Debug)]
pub struct TrapBackend {
    memory: RegionMap,
    #[cfg_attr(
        not(all(target_os = "linux", target_arch = "x86")),
        allow(dead_code)
    )]
    ports: HostPorts,
    frame: CallFrame,
}

impl TrapBackend {
    pub fn new(mut memory: RegionMap, ports: HostPorts) -> Result<Self, BackendError> {
        if !cfg!(all(target_os = "linux", target_arch = "x86")) {
            return Err(BackendError::Unsupported {
                backend: BackendKind::Trap,
                reason: "vm86 mode needs a 32-bit x86 Linux host",
            });
        }
        if let Some(region) = memory
            .regions()
            .find(|r| r.bytes().as_ptr() as usize != r.base().linear() as usize)
        {
            debug!(region = %region.kind(), base = %region.base(), "region is not identity-mapped");
            return Err(BackendError::Unsupported {
                backend: BackendKind::Trap,
                reason: "real-mode memory is not identity-mapped",
            });
        }
        let frame = CallFrame::install(&mut memory)?;
        Ok(Self {
            memory,
            ports,
            frame,
        })
    }

    #[cfg(all(target_os = "linux", target_arch = "x86"))]
    fn run(&mut self, mut cpu: CpuState) -> Result<CpuState, BackendError> {
        use crate::emulator::interp::{self, StepExit, SystemBus};
        use vm86::Exit;

        loop {
            match vm86::enter(&mut cpu)? {
                Exit::Interrupt(vector) => {
                    let mut bus = SystemBus {
                        memory: &mut self.memory,
                        ports: &mut self.ports,
                    };
                    let return_ip = cpu.eip;
                    interp::deliver_interrupt(&mut cpu, &mut bus, vector, return_ip)?;
                }
                Exit::Unknown => {
                    if self.frame.is_return(cpu.cs, cpu.eip) {
                        return Ok(cpu);
                    }
                    let mut bus = SystemBus {
                        memory: &mut self.memory,
                        ports: &mut self.ports,
                    };
                    if let StepExit::Halted { cs, ip } = interp::step(&mut cpu, &mut bus)? {
                        return Err(BackendError::UnexpectedHalt { cs, ip });
                    }
                }
                Exit::Signal | Exit::Sti | Exit::PicReturn => {}
                Exit::Trap(n) => {
                    return Err(BackendError::Trap(format!(
                        "trap {n} at {:04x}:{:04x}",
                        cpu.cs,
                        cpu.ip()
                    )))
                }
            }
        }
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86")))]
    fn run(&mut self, _cpu: CpuState) -> Result<CpuState, BackendError> {
        Err(BackendError::Unsupported {
            backend: BackendKind::Trap,
            reason: "vm86 mode needs a 32-bit x86 Linux host",
        })
    }
}

impl ExecutionBackend for TrapBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Trap
    }

    fn memory(&self) -> &dyn RealModeMemory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut dyn RealModeMemory {
        &mut self.memory
    }

    fn execute_interrupt(&mut self, vector: u8, regs: &CpuState) -> Result<CpuState, BackendError> {
        let cpu = self.frame.enter(&mut self.memory, vector, regs)?;
        debug!(vector, cs = cpu.cs, ip = cpu.ip(), "entering vm86");
        self.run(cpu)
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86"))]
mod vm86 {
    use crate::{state::CpuState, BackendError};

    const VM86_ENTER: libc::c_long = 1;
    const CPU_386: u32 = 3;

    const VM86_SIGNAL: i32 = 0;
    const VM86_UNKNOWN: i32 = 1;
    const VM86_INTX: i32 = 2;
    const VM86_STI: i32 = 3;
    const VM86_PICRETURN: i32 = 4;
    const VM86_TRAP: i32 = 6;

    #[repr(C)]
    #[derive(Default)]
    #[allow(dead_code)]
    struct Regs {
        ebx: u32,
        ecx: u32,
        edx: u32,
        esi: u32,
        edi: u32,
        ebp: u32,
        eax: u32,
        null_ds: u32,
        null_es: u32,
        null_fs: u32,
        null_gs: u32,
        orig_eax: u32,
        eip: u32,
        cs: u16,
        csh: u16,
        eflags: u32,
        esp: u32,
        ss: u16,
        ssh: u16,
        es: u16,
        esh: u16,
        ds: u16,
        dsh: u16,
        fs: u16,
        fsh: u16,
        gs: u16,
        gsh: u16,
    }

    #[repr(C)]
    #[derive(Default)]
    struct Revectored {
        map: [u32; 8],
    }

    #[repr(C)]
    #[derive(Default)]
    #[allow(dead_code)]
    struct PlusInfo {
        flags: u32,
        debug_int_table: [u8; 32],
    }

    #[repr(C)]
    #[derive(Default)]
    #[allow(dead_code)]
    struct Vm86Plus {
        regs: Regs,
        flags: u32,
        screen_bitmap: u32,
        cpu_type: u32,
        int_revectored: Revectored,
        int21_revectored: Revectored,
        plus: PlusInfo,
    }

    pub(super) enum Exit {
        Signal,
        Unknown,
        Interrupt(u8),
        Sti,
        PicReturn,
        Trap(u8),
    }

    /// Runs `cpu` in vm86 mode until the kernel returns control.
    pub(super) fn enter(cpu: &mut CpuState) -> Result<Exit, BackendError> {
        let mut vm = Vm86Plus {
            regs: Regs {
                ebx: cpu.ebx,
                ecx: cpu.ecx,
                edx: cpu.edx,
                esi: cpu.esi,
                edi: cpu.edi,
                ebp: cpu.ebp,
                eax: cpu.eax,
                eip: cpu.eip,
                cs: cpu.cs,
                eflags: cpu.eflags,
                esp: cpu.esp,
                ss: cpu.ss,
                es: cpu.es,
                ds: cpu.ds,
                fs: cpu.fs,
                gs: cpu.gs,
                ..Default::default()
            },
            cpu_type: CPU_386,
            int_revectored: Revectored { map: [u32::MAX; 8] },
            ..Default::default()
        };

        // SAFETY: `vm` is a valid vm86plus_struct for the duration of the
        // call; the kernel writes the final register state back into it.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_vm86,
                VM86_ENTER,
                &mut vm as *mut Vm86Plus as libc::c_long,
            )
        };
        if rc < 0 {
            return Err(BackendError::Trap(format!(
                "vm86 entry failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let regs = &vm.regs;
        *cpu = CpuState {
            eax: regs.eax,
            ebx: regs.ebx,
            ecx: regs.ecx,
            edx: regs.edx,
            esi: regs.esi,
            edi: regs.edi,
            ebp: regs.ebp,
            esp: regs.esp,
            eip: regs.eip,
            eflags: regs.eflags,
            cs: regs.cs,
            ds: regs.ds,
            es: regs.es,
            fs: regs.fs,
            gs: regs.gs,
            ss: regs.ss,
        };

        let rc = rc as i32;
        let arg = (rc >> 8) as u8;
        Ok(match rc & 0xFF {
            VM86_SIGNAL => Exit::Signal,
            VM86_UNKNOWN => Exit::Unknown,
            VM86_INTX => Exit::Interrupt(arg),
            VM86_STI => Exit::Sti,
            VM86_PICRETURN => Exit::PicReturn,
            VM86_TRAP => Exit::Trap(arg),
            other => {
                return Err(BackendError::Trap(format!(
                    "unexpected vm86 return type {other}"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(all(target_os = "linux", target_arch = "x86")))]
    #[test]
    fn unavailable_off_32_bit_x86() {
        // Port privilege is not needed to reach the platform check.
        let ports = match HostPorts::acquire() {
            Ok(ports) => ports,
            Err(_) => return,
        };
        let err = TrapBackend::new(RegionMap::default(), ports).unwrap_err();
        assert!(matches!(
            err,
            BackendError::Unsupported {
                backend: BackendKind::Trap,
                ..
            }
        ));
    }

    #[cfg(all(target_os = "linux", target_arch = "x86"))]
    #[test]
    fn rejects_memory_that_is_not_identity_mapped() {
        use v86_mem::{MemoryRegion, RealModeAddress, RegionKind};

        let ports = match HostPorts::acquire() {
            Ok(ports) => ports,
            Err(_) => return,
        };
        let memory = RegionMap::default()
            .with(MemoryRegion::zeroed(
                RegionKind::Scratch,
                RealModeAddress::new(0x10000).unwrap(),
                0x20000,
            ))
            .unwrap();
        assert!(matches!(
            TrapBackend::new(memory, ports),
            Err(BackendError::Unsupported { .. })
        ));
    }
}

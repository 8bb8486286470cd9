//! Backend delegating to the LRMI library.
//!
//! LRMI owns the low megabyte: `LRMI_init` maps it at identity addresses,
//! manages its own scratch pool and enters vm86 mode itself. This backend
//! only translates register files and exposes that memory through
//! [`RealModeMemory`]. It is compiled in with the `lrmi` feature; without it
//! [`LibraryBackend::new`] always fails.

use v86_mem::RealModeMemory;

use crate::{state::CpuState, BackendError, BackendKind, ExecutionBackend, HostPorts};

pub use imp::LibraryBackend;

#[cfg(feature = "lrmi")]
mod imp {
    use std::os::raw::{c_int, c_uint, c_ushort, c_void};

    use tracing::{debug, warn};
    use v86_mem::{AllocError, MemoryError, RealModeAddress, REAL_MODE_LIMIT};

    use super::*;

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    #[allow(dead_code)]
    struct LrmiRegs {
        edi: c_uint,
        esi: c_uint,
        ebp: c_uint,
        reserved: c_uint,
        ebx: c_uint,
        edx: c_uint,
        ecx: c_uint,
        eax: c_uint,
        flags: c_ushort,
        es: c_ushort,
        ds: c_ushort,
        fs: c_ushort,
        gs: c_ushort,
        ip: c_ushort,
        cs: c_ushort,
        sp: c_ushort,
        ss: c_ushort,
    }

    impl From<&CpuState> for LrmiRegs {
        fn from(cpu: &CpuState) -> Self {
            Self {
                edi: cpu.edi,
                esi: cpu.esi,
                ebp: cpu.ebp,
                reserved: 0,
                ebx: cpu.ebx,
                edx: cpu.edx,
                ecx: cpu.ecx,
                eax: cpu.eax,
                flags: cpu.eflags as u16,
                es: cpu.es,
                ds: cpu.ds,
                fs: cpu.fs,
                gs: cpu.gs,
                ip: cpu.ip(),
                cs: cpu.cs,
                sp: cpu.sp(),
                ss: cpu.ss,
            }
        }
    }

    impl LrmiRegs {
        fn apply(&self, cpu: &mut CpuState) {
            cpu.edi = self.edi;
            cpu.esi = self.esi;
            cpu.ebp = self.ebp;
            cpu.ebx = self.ebx;
            cpu.edx = self.edx;
            cpu.ecx = self.ecx;
            cpu.eax = self.eax;
            cpu.set_flags16(self.flags);
            cpu.es = self.es;
            cpu.ds = self.ds;
            cpu.fs = self.fs;
            cpu.gs = self.gs;
            cpu.cs = self.cs;
            cpu.set_ip(self.ip);
            cpu.ss = self.ss;
            cpu.set_sp(self.sp);
        }
    }

    #[link(name = "lrmi")]
    extern "C" {
        fn LRMI_init() -> c_int;
        fn LRMI_int(interrupt: c_int, regs: *mut LrmiRegs) -> c_int;
        fn LRMI_alloc_real(size: c_int) -> *mut c_void;
        fn LRMI_free_real(block: *mut c_void);
    }

    /// The identity-mapped low megabyte set up by `LRMI_init`.
    #[derive(Debug, Default)]
    struct LrmiMemory {
        live: Vec<RealModeAddress>,
    }

    impl LrmiMemory {
        fn span(addr: RealModeAddress, len: usize) -> Result<*mut u8, MemoryError> {
            let end = addr.linear() as usize + len;
            if end > REAL_MODE_LIMIT as usize {
                return Err(MemoryError::OutOfRange { addr: end as u32 });
            }
            Ok(addr.linear() as usize as *mut u8)
        }
    }

    impl RealModeMemory for LrmiMemory {
        fn alloc(&mut self, size: u32) -> Result<RealModeAddress, AllocError> {
            if size == 0 {
                return Err(AllocError::ZeroSize);
            }
            let requested = size;
            let size = c_int::try_from(size).map_err(|_| AllocError::Exhausted { requested })?;
            // SAFETY: LRMI_init succeeded before this memory was handed out.
            let block = unsafe { LRMI_alloc_real(size) };
            if block.is_null() {
                return Err(AllocError::Exhausted { requested });
            }
            let addr = RealModeAddress::new(block as usize as u32)
                .ok_or(AllocError::Exhausted { requested })?;
            self.live.push(addr);
            Ok(addr)
        }

        fn free(&mut self, addr: RealModeAddress) -> Result<(), AllocError> {
            let pos = self
                .live
                .iter()
                .position(|&a| a == addr)
                .ok_or(AllocError::NotAllocated { addr })?;
            self.live.swap_remove(pos);
            // SAFETY: `addr` came from LRMI_alloc_real and was not yet freed.
            unsafe { LRMI_free_real(addr.linear() as usize as *mut c_void) };
            Ok(())
        }

        fn read(&self, addr: RealModeAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
            let src = Self::span(addr, buf.len())?;
            // SAFETY: LRMI maps the whole low megabyte at identity addresses.
            unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
            Ok(())
        }

        fn write(&mut self, addr: RealModeAddress, data: &[u8]) -> Result<(), MemoryError> {
            let dst = Self::span(addr, data.len())?;
            // SAFETY: see `read`.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
            Ok(())
        }
    }

    /// Runs BIOS calls through `LRMI_int`.
    #[derive(Debug)]
    pub struct LibraryBackend {
        memory: LrmiMemory,
        _ports: HostPorts,
    }

    impl LibraryBackend {
        /// Initialises LRMI. I/O privilege must already be held, which
        /// `ports` proves.
        pub fn new(ports: HostPorts) -> Result<Self, BackendError> {
            // SAFETY: plain library initialisation.
            if unsafe { LRMI_init() } == 0 {
                return Err(BackendError::Unsupported {
                    backend: BackendKind::Library,
                    reason: "LRMI_init failed",
                });
            }
            debug!("LRMI initialised");
            Ok(Self {
                memory: LrmiMemory::default(),
                _ports: ports,
            })
        }
    }

    impl ExecutionBackend for LibraryBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Library
        }

        fn memory(&self) -> &dyn RealModeMemory {
            &self.memory
        }

        fn memory_mut(&mut self) -> &mut dyn RealModeMemory {
            &mut self.memory
        }

        fn execute_interrupt(
            &mut self,
            vector: u8,
            regs: &CpuState,
        ) -> Result<CpuState, BackendError> {
            let mut lrmi = LrmiRegs::from(regs);
            // SAFETY: `lrmi` is a valid, exclusively borrowed register block.
            if unsafe { LRMI_int(vector as c_int, &mut lrmi) } == 0 {
                warn!(vector, "LRMI_int failed");
                return Err(BackendError::Library { vector });
            }
            let mut out = *regs;
            lrmi.apply(&mut out);
            Ok(out)
        }
    }

}

#[cfg(not(feature = "lrmi"))]
mod imp {
    use core::convert::Infallible;

    use super::*;

    /// Placeholder when built without the `lrmi` feature; it cannot be
    /// constructed.
    #[derive(Debug)]
    pub struct LibraryBackend {
        never: Infallible,
    }

    impl LibraryBackend {
        pub fn new(_ports: HostPorts) -> Result<Self, BackendError> {
            Err(BackendError::Unsupported {
                backend: BackendKind::Library,
                reason: "built without the `lrmi` feature",
            })
        }
    }

    impl ExecutionBackend for LibraryBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Library
        }

        fn memory(&self) -> &dyn RealModeMemory {
            match self.never {}
        }

        fn memory_mut(&mut self) -> &mut dyn RealModeMemory {
            match self.never {}
        }

        fn execute_interrupt(
            &mut self,
            _vector: u8,
            _regs: &CpuState,
        ) -> Result<CpuState, BackendError> {
            match self.never {}
        }
    }
}

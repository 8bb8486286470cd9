//! Port I/O on behalf of BIOS code.

use tracing::debug;

use crate::BackendError;

/// First port past the range BIOS code is granted through `ioperm`.
pub const IOPERM_PORTS: u16 = 1024;

/// Byte/word/dword port accesses.
pub trait PortIo {
    fn inb(&mut self, port: u16) -> u8;
    fn inw(&mut self, port: u16) -> u16;
    fn inl(&mut self, port: u16) -> u32;
    fn outb(&mut self, port: u16, value: u8);
    fn outw(&mut self, port: u16, value: u16);
    fn outl(&mut self, port: u16, value: u32);

    /// Sized read used by the interpreter; `size` is 1, 2 or 4 bytes.
    fn read(&mut self, port: u16, size: u32) -> u32 {
        match size {
            1 => self.inb(port) as u32,
            2 => self.inw(port) as u32,
            _ => self.inl(port),
        }
    }

    fn write(&mut self, port: u16, size: u32, value: u32) {
        match size {
            1 => self.outb(port, value as u8),
            2 => self.outw(port, value as u16),
            _ => self.outl(port, value),
        }
    }
}

/// Direct access to the host's I/O ports.
///
/// Construction raises the process I/O privilege level, which needs
/// `CAP_SYS_RAWIO`.
#[derive(Debug)]
pub struct HostPorts {
    _private: (),
}

impl HostPorts {
    #[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
    pub fn acquire() -> Result<Self, BackendError> {
        // SAFETY: plain syscalls; failure is reported through errno.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_ioperm,
                0 as libc::c_long,
                IOPERM_PORTS as libc::c_long,
                1 as libc::c_long,
            )
        };
        if rc != 0 {
            return Err(BackendError::Privilege(std::io::Error::last_os_error()));
        }
        // SAFETY: as above.
        let rc = unsafe { libc::syscall(libc::SYS_iopl, 3 as libc::c_long) };
        if rc != 0 {
            return Err(BackendError::Privilege(std::io::Error::last_os_error()));
        }
        debug!("raised I/O privilege level");
        Ok(Self { _private: () })
    }

    #[cfg(not(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64"))))]
    pub fn acquire() -> Result<Self, BackendError> {
        debug!("host port I/O requested on an unsupported platform");
        Err(BackendError::Unsupported {
            backend: crate::BackendKind::Emulator,
            reason: "host port I/O needs Linux on x86",
        })
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod raw {
    use core::arch::asm;

    // SAFETY (all functions): callers hold I/O privilege via `HostPorts`.
    pub unsafe fn inb(port: u16) -> u8 {
        let value: u8;
        asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
        value
    }

    pub unsafe fn inw(port: u16) -> u16 {
        let value: u16;
        asm!("in ax, dx", out("ax") value, in("dx") port, options(nomem, nostack, preserves_flags));
        value
    }

    pub unsafe fn inl(port: u16) -> u32 {
        let value: u32;
        asm!("in eax, dx", out("eax") value, in("dx") port, options(nomem, nostack, preserves_flags));
        value
    }

    pub unsafe fn outb(port: u16, value: u8) {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }

    pub unsafe fn outw(port: u16, value: u16) {
        asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags));
    }

    pub unsafe fn outl(port: u16, value: u32) {
        asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags));
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl PortIo for HostPorts {
    fn inb(&mut self, port: u16) -> u8 {
        // SAFETY: `self` proves the privilege was granted.
        unsafe { raw::inb(port) }
    }

    fn inw(&mut self, port: u16) -> u16 {
        // SAFETY: see `inb`.
        unsafe { raw::inw(port) }
    }

    fn inl(&mut self, port: u16) -> u32 {
        // SAFETY: see `inb`.
        unsafe { raw::inl(port) }
    }

    fn outb(&mut self, port: u16, value: u8) {
        // SAFETY: see `inb`.
        unsafe { raw::outb(port, value) }
    }

    fn outw(&mut self, port: u16, value: u16) {
        // SAFETY: see `inb`.
        unsafe { raw::outw(port, value) }
    }

    fn outl(&mut self, port: u16, value: u32) {
        // SAFETY: see `inb`.
        unsafe { raw::outl(port, value) }
    }
}

// Unreachable: `HostPorts::acquire` always fails off x86.
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
impl PortIo for HostPorts {
    fn inb(&mut self, _port: u16) -> u8 {
        0xFF
    }

    fn inw(&mut self, _port: u16) -> u16 {
        0xFFFF
    }

    fn inl(&mut self, _port: u16) -> u32 {
        0xFFFF_FFFF
    }

    fn outb(&mut self, _port: u16, _value: u8) {}

    fn outw(&mut self, _port: u16, _value: u16) {}

    fn outl(&mut self, _port: u16, _value: u32) {}
}

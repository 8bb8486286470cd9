//! Host mappings backing real-mode regions.

use std::{fs::File, io, os::fd::AsRawFd, path::Path, ptr};

use crate::MapError;

/// Where a host window is placed in the process address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Let the kernel pick the address.
    #[default]
    Anywhere,
    /// Map at the virtual address equal to the real-mode linear address, as
    /// required when the CPU itself executes the BIOS in virtual-8086 mode.
    Identity,
}

/// How writes to a device-backed window behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Writes reach physical memory (IVT, BDA, EBDA, framebuffer).
    Shared,
    /// Writes stay private to this process (ROM shadows).
    Private,
}

/// A page-granular `mmap` covering `len` bytes starting at a real-mode
/// linear address, either backed by the physical memory device or anonymous.
pub struct HostWindow {
    map: *mut u8,
    map_len: usize,
    /// Distance from the page-aligned mapping start to the first byte of the
    /// window, for sources that do not start on a page boundary.
    lead: usize,
    len: usize,
}

// Safety: the window exclusively owns its mapping.
unsafe impl Send for HostWindow {}
unsafe impl Sync for HostWindow {}

impl HostWindow {
    /// Maps `len` bytes of physical memory at `phys` from `device`
    /// (normally `/dev/mem`).
    pub fn physical(
        device: &Path,
        phys: u32,
        len: usize,
        sharing: Sharing,
        placement: Placement,
    ) -> Result<Self, MapError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|source| MapError::Device {
                path: device.to_path_buf(),
                source,
            })?;
        let flags = match sharing {
            Sharing::Shared => libc::MAP_SHARED,
            Sharing::Private => libc::MAP_PRIVATE,
        };
        Self::map(phys, len, flags, file.as_raw_fd(), placement)
    }

    /// Maps `len` zeroed bytes standing in for real-mode memory at `linear`.
    pub fn anonymous(linear: u32, len: usize, placement: Placement) -> Result<Self, MapError> {
        Self::map(
            linear,
            len,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            placement,
        )
    }

    fn map(
        start: u32,
        len: usize,
        flags: libc::c_int,
        fd: libc::c_int,
        placement: Placement,
    ) -> Result<Self, MapError> {
        let page = page_size();
        let aligned = (start as usize) & !(page - 1);
        let lead = start as usize - aligned;
        let map_len = (lead + len + page - 1) & !(page - 1);

        let (hint, flags, prot) = match placement {
            Placement::Anywhere => (ptr::null_mut(), flags, libc::PROT_READ | libc::PROT_WRITE),
            Placement::Identity => (
                aligned as *mut libc::c_void,
                flags | libc::MAP_FIXED,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            ),
        };
        let offset = if fd >= 0 { aligned as libc::off_t } else { 0 };

        // SAFETY: the arguments describe a fresh mapping. `MAP_FIXED` is only
        // requested for identity placement inside the low megabyte, which
        // the process reserves for real-mode execution.
        let map = unsafe {
            libc::mmap(
                hint,
                map_len,
                prot,
                flags,
                fd,
                offset,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(MapError::Mmap {
                phys: start,
                len,
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            map: map as *mut u8,
            map_len,
            lead,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `lead + len <= map_len` and the mapping lives as long as self.
        unsafe { std::slice::from_raw_parts(self.map.add(self.lead), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.map.add(self.lead), self.len) }
    }
}

impl Drop for HostWindow {
    fn drop(&mut self) {
        // SAFETY: `map`/`map_len` are exactly what `mmap` returned.
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.map_len);
        }
    }
}

impl std::fmt::Debug for HostWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostWindow")
            .field("map", &self.map)
            .field("len", &self.len)
            .finish()
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

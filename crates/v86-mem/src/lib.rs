//! Real-mode address space for executing BIOS code from a 32/64-bit host.
//!
//! The first megabyte is modelled as a small set of named regions
//! ([`RegionMap`]) backed either by host memory mappings or by plain
//! buffers, plus a first-fit allocator over the scratch region that hands out
//! paragraph-aligned blocks for stacks, return stubs and call buffers.

mod addr;
pub mod alloc;
mod error;
mod host;
pub mod layout;
mod region;

pub use addr::{RealModeAddress, REAL_MODE_LIMIT};
pub use alloc::{Block, ScratchPool, BLOCK_ALIGN, DEFAULT_BLOCK_CAPACITY};
pub use error::{AllocError, MapError, MemoryError};
pub use host::{HostWindow, Placement, Sharing};
pub use layout::HostLayout;
pub use region::{Backing, MemoryRegion, RealModeMemory, RegionKind, RegionMap};

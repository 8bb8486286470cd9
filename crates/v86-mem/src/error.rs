use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{RealModeAddress, RegionKind};

/// Failure to access the simulated real-mode address space.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("address {addr:#07x} is not backed by any mapped region")]
    Unmapped { addr: u32 },

    #[error("address {addr:#x} is outside the 20-bit real-mode address space")]
    OutOfRange { addr: u32 },
}

/// Failure of the scratch pool allocator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("no free scratch block can hold {requested} bytes")]
    Exhausted { requested: u32 },

    #[error("scratch descriptor table is full ({capacity} entries)")]
    TableFull { capacity: usize },

    #[error("zero-sized scratch allocation")]
    ZeroSize,

    #[error("{addr} is not the start of a live scratch allocation")]
    NotAllocated { addr: RealModeAddress },

    #[error("no scratch region is mapped")]
    NoPool,
}

impl AllocError {
    /// Whether the request failed only for lack of space.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::TableFull { .. })
    }
}

/// Failure while assembling a [`crate::RegionMap`].
#[derive(Debug, Error)]
pub enum MapError {
    #[error("{kind} region at {base} overlaps the {other} region")]
    Overlap {
        kind: RegionKind,
        base: RealModeAddress,
        other: RegionKind,
    },

    #[error("{kind} region at {base} with length {len:#x} does not fit below 1 MiB")]
    OutOfRange {
        kind: RegionKind,
        base: RealModeAddress,
        len: usize,
    },

    #[error("{kind} region is empty")]
    Empty { kind: RegionKind },

    #[error("a scratch region is already mapped")]
    DuplicateScratch,

    #[error("failed to open memory device {path}: {source}")]
    Device {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to map {len:#x} bytes at physical {phys:#07x}: {source}")]
    Mmap {
        phys: u32,
        len: usize,
        #[source]
        source: io::Error,
    },
}

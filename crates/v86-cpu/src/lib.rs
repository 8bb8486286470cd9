//! Real-mode execution backends for running BIOS interrupt handlers.
//!
//! A backend takes a [`CpuState`], runs the handler of one software
//! interrupt to completion against the real-mode memory it owns and returns
//! the resulting register file. Three interchangeable strategies exist:
//!
//! - [`EmulatorBackend`]: the built-in interpreter, portable.
//! - [`TrapBackend`]: native vm86 execution on 32-bit x86 Linux.
//! - [`LibraryBackend`]: the external LRMI library (`lrmi` feature).

mod backend;
mod emulator;
mod error;
mod lrmi;
mod ports;
pub mod state;
mod trap;

pub use backend::{Backend, BackendKind, ExecutionBackend, STACK_SIZE};
pub use emulator::{EmulatorBackend, DEFAULT_STEP_BUDGET};
pub use error::BackendError;
pub use lrmi::LibraryBackend;
pub use ports::{HostPorts, PortIo, IOPERM_PORTS};
pub use state::CpuState;
pub use trap::TrapBackend;

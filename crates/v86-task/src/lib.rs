//! BIOS call tasks and their synchronous execution.
//!
//! A [`Task`] carries a register file and an optional buffer; [`Engine`]
//! stages the buffer in real-mode memory, runs the video BIOS through an
//! [`ExecutionBackend`](v86_cpu::ExecutionBackend) and copies the results
//! back. VBE Info Block results additionally go through [`relocate`] so the
//! caller gets buffer offsets instead of real-mode pointers.

mod engine;
mod error;
pub mod relocate;
mod task;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod vbe;

pub use engine::Engine;
pub use error::{Result, TaskError};
pub use relocate::relocate;
pub use task::{Task, TaskFlags, WireError, HEADER_LEN, MAX_BUFFER_LEN};

//! `v86d`: executes real-mode video BIOS calls for a VESA framebuffer
//! driver.
//!
//! The binary detaches, binds a Unix socket and runs every task it receives
//! through a [`v86_task::Engine`] over the configured execution backend.

pub mod config;
pub mod daemon;
pub mod probe;

pub use config::{Args, Command, Config};
pub use daemon::{open_backend, serve, stop};
pub use probe::{probe, ProbeError, ProbeReport};

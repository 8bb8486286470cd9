use std::path::PathBuf;

use clap::{Parser, Subcommand};
use v86_cpu::{BackendKind, DEFAULT_STEP_BUDGET};
use v86_mem::DEFAULT_BLOCK_CAPACITY;

pub const DEFAULT_SOCKET: &str = "/run/v86d.sock";
pub const DEFAULT_MEM_DEVICE: &str = "/dev/mem";

#[derive(Debug, Clone, Parser)]
#[command(name = "v86d", version, about)]
pub struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Execution backend: `emulator`, `trap` (vm86) or `lrmi`.
    ///
    /// Environment variable: `V86D_BACKEND`.
    #[arg(long, env = "V86D_BACKEND")]
    backend: Option<BackendKind>,

    /// Unix socket the engine listens on.
    ///
    /// Environment variable: `V86D_SOCKET`.
    #[arg(long, env = "V86D_SOCKET")]
    socket: Option<PathBuf>,

    /// Stay attached to the terminal instead of detaching.
    ///
    /// Environment variable: `V86D_FOREGROUND`.
    #[arg(long, env = "V86D_FOREGROUND")]
    foreground: bool,

    /// Instructions one BIOS call may run in the emulator.
    ///
    /// Environment variable: `V86D_STEP_BUDGET`.
    #[arg(long, env = "V86D_STEP_BUDGET")]
    step_budget: Option<u64>,

    /// Block descriptors available to the scratch allocator.
    ///
    /// Environment variable: `V86D_SCRATCH_BLOCKS`.
    #[arg(long, env = "V86D_SCRATCH_BLOCKS")]
    scratch_blocks: Option<usize>,

    /// Physical memory device the low megabyte is mapped from.
    ///
    /// Environment variable: `V86D_MEM_DEVICE`.
    #[arg(long, env = "V86D_MEM_DEVICE")]
    mem_device: Option<PathBuf>,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `V86D_LOG`.
    #[arg(long, env = "V86D_LOG")]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Serve BIOS calls on the socket (the default).
    Serve,
    /// Query the video BIOS once and print what it reports.
    Probe,
    /// Ask a running engine to exit.
    Stop,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub backend: BackendKind,
    pub socket: PathBuf,
    pub foreground: bool,
    pub step_budget: u64,
    pub scratch_blocks: usize,
    pub mem_device: PathBuf,
    pub log_level: String,
}

impl Config {
    pub fn load() -> Self {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Self {
        let scratch_blocks = match args.scratch_blocks {
            Some(0) | None => DEFAULT_BLOCK_CAPACITY,
            Some(n) => n,
        };
        let log_level = args
            .log_level
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string());

        Self {
            command: args.command.unwrap_or(Command::Serve),
            backend: args.backend.unwrap_or_else(default_backend),
            socket: args.socket.unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET)),
            foreground: args.foreground,
            step_budget: args.step_budget.unwrap_or(DEFAULT_STEP_BUDGET),
            scratch_blocks,
            mem_device: args
                .mem_device
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MEM_DEVICE)),
            log_level,
        }
    }
}

/// Native vm86 execution where the host supports it, the interpreter
/// elsewhere.
pub fn default_backend() -> BackendKind {
    if cfg!(all(target_os = "linux", target_arch = "x86")) {
        BackendKind::Trap
    } else {
        BackendKind::Emulator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Config {
        Config::from_args(Args::try_parse_from(argv).unwrap())
    }

    #[test]
    fn defaults() {
        let config = parse(&["v86d"]);
        assert_eq!(config.command, Command::Serve);
        assert_eq!(config.backend, default_backend());
        assert_eq!(config.socket, PathBuf::from(DEFAULT_SOCKET));
        assert!(!config.foreground);
        assert_eq!(config.step_budget, DEFAULT_STEP_BUDGET);
        assert_eq!(config.scratch_blocks, DEFAULT_BLOCK_CAPACITY);
        assert_eq!(config.mem_device, PathBuf::from(DEFAULT_MEM_DEVICE));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "v86d",
            "--backend",
            "vm86",
            "--socket",
            "/tmp/x.sock",
            "--foreground",
            "--step-budget",
            "1000",
            "--scratch-blocks",
            "0",
            "--log-level",
            " debug ",
            "probe",
        ]);
        assert_eq!(config.command, Command::Probe);
        assert_eq!(config.backend, BackendKind::Trap);
        assert_eq!(config.socket, PathBuf::from("/tmp/x.sock"));
        assert!(config.foreground);
        assert_eq!(config.step_budget, 1000);
        assert_eq!(config.scratch_blocks, DEFAULT_BLOCK_CAPACITY);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(Args::try_parse_from(["v86d", "--backend", "qemu"]).is_err());
    }
}

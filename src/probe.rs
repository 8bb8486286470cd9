//! One-shot query of the video BIOS.

use std::fmt;

use thiserror::Error;
use tracing::{trace, warn};
use v86_cpu::{CpuState, ExecutionBackend};
use v86_task::{
    relocate::PointerField,
    vbe::{
        succeeded, InfoBlock, ModeInfo, VbeError, INFO_BLOCK_LEN, MODE_INFO_LEN,
        VBE2_SIGNATURE, VBE_GET_CONTROLLER_INFO, VBE_GET_MODE_INFO,
    },
    Engine, Task, TaskError, TaskFlags,
};

/// Info Block buffer: the block itself plus room for the strings and mode
/// list the BIOS keeps in ROM.
const PROBE_BUFFER_LEN: usize = INFO_BLOCK_LEN * 4;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("VBE function {function:#06x} failed with AX={ax:#06x}")]
    Bios { function: u16, ax: u16 },

    #[error(transparent)]
    Vbe(#[from] VbeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeReport {
    pub mode: u16,
    /// `None` when the BIOS refused 0x4F01 for this mode.
    pub info: Option<ModeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub version: u16,
    pub oem: Option<String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub revision: Option<String>,
    pub total_memory: u32,
    pub modes: Vec<ModeReport>,
}

/// Reads the controller Info Block, then the Mode Info Block of every
/// listed mode.
pub fn probe<B: ExecutionBackend>(engine: &mut Engine<B>) -> Result<ProbeReport, ProbeError> {
    let mut buf = vec![0u8; PROBE_BUFFER_LEN];
    buf[..4].copy_from_slice(VBE2_SIGNATURE);
    let mut task = Task::new(
        TaskFlags::VBE_INFO_BLOCK,
        CpuState {
            eax: VBE_GET_CONTROLLER_INFO as u32,
            ..Default::default()
        },
        buf,
    );
    engine.run(&mut task)?;
    if !succeeded(task.regs.ax()) {
        return Err(ProbeError::Bios {
            function: VBE_GET_CONTROLLER_INFO,
            ax: task.regs.ax(),
        });
    }

    let block = InfoBlock::parse(&task.buf)?;
    let text = |field| block.string(field).map(str::to_owned);
    let mut report = ProbeReport {
        version: block.version(),
        oem: text(PointerField::OemString),
        vendor: text(PointerField::OemVendorName),
        product: text(PointerField::OemProductName),
        revision: text(PointerField::OemProductRev),
        total_memory: block.total_memory(),
        modes: Vec::new(),
    };

    for mode in block.modes() {
        let info = mode_info(engine, mode)?;
        trace!(mode, ?info, "mode probed");
        report.modes.push(ModeReport { mode, info });
    }
    Ok(report)
}

fn mode_info<B: ExecutionBackend>(
    engine: &mut Engine<B>,
    mode: u16,
) -> Result<Option<ModeInfo>, ProbeError> {
    let mut task = Task::new(
        TaskFlags::BUF_ES_DI | TaskFlags::BUF_RETURN,
        CpuState {
            eax: VBE_GET_MODE_INFO as u32,
            ecx: mode as u32,
            ..Default::default()
        },
        vec![0; MODE_INFO_LEN],
    );
    engine.run(&mut task)?;
    if !succeeded(task.regs.ax()) {
        warn!(mode, ax = task.regs.ax(), "BIOS has no mode info");
        return Ok(None);
    }
    Ok(Some(ModeInfo::parse(&task.buf)?))
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = |s: &Option<String>| s.clone().unwrap_or_else(|| "-".to_string());
        writeln!(
            f,
            "VBE version {}.{}",
            self.version >> 8,
            self.version & 0xFF
        )?;
        writeln!(f, "OEM string: {}", text(&self.oem))?;
        writeln!(f, "Vendor:     {}", text(&self.vendor))?;
        writeln!(f, "Product:    {}", text(&self.product))?;
        writeln!(f, "Revision:   {}", text(&self.revision))?;
        writeln!(f, "Memory:     {} KiB", self.total_memory / 1024)?;
        for mode in &self.modes {
            match &mode.info {
                Some(info) => writeln!(
                    f,
                    "mode {:#06x}: {}x{}x{}{}",
                    mode.mode,
                    info.width,
                    info.height,
                    info.bits_per_pixel,
                    if info.has_linear_framebuffer() {
                        format!(" lfb {:#010x}", info.phys_base)
                    } else {
                        String::new()
                    }
                )?,
                None => writeln!(f, "mode {:#06x}: unavailable", mode.mode)?,
            }
        }
        Ok(())
    }
}

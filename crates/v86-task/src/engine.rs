//! Synchronous task execution.

use tracing::{debug, warn};
use v86_cpu::ExecutionBackend;
use v86_mem::RealModeAddress;

use crate::{
    relocate::relocate,
    vbe::{succeeded, INFO_BLOCK_LEN, VIDEO_INTERRUPT},
    Result, Task, TaskError, TaskFlags,
};

/// Runs tasks on one execution backend.
///
/// Each call stages the task's buffer in scratch memory, executes
/// interrupt 0x10 and copies results back. The scratch block is released on
/// every path, so a failing call never leaks pool space.
#[derive(Debug)]
pub struct Engine<B> {
    backend: B,
}

impl<B: ExecutionBackend> Engine<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Executes `task`, replacing its registers (and buffer, when the flags
    /// ask for it and the call reports VBE success) with the result.
    ///
    /// BIOS-level failure is not an error here: the caller inspects AX.
    pub fn run(&mut self, task: &mut Task) -> Result<()> {
        let info_block = task.flags.contains(TaskFlags::VBE_INFO_BLOCK);
        if info_block && task.buf.len() < INFO_BLOCK_LEN {
            return Err(TaskError::InfoBlockTooSmall {
                len: task.buf.len(),
            });
        }

        let scratch = if info_block || !task.buf.is_empty() {
            Some(self.backend.memory_mut().alloc(task.buf.len() as u32)?)
        } else {
            None
        };

        let outcome = self.call(task, scratch);
        let released = match scratch {
            Some(block) => self.backend.memory_mut().free(block).map_err(TaskError::from),
            None => Ok(()),
        };
        if let Err(err) = &released {
            warn!(%err, "failed to release task buffer");
        }
        outcome?;
        released
    }

    fn call(&mut self, task: &mut Task, scratch: Option<RealModeAddress>) -> Result<()> {
        let mut regs = task.regs;
        if let Some(block) = scratch {
            self.backend.memory_mut().write(block, &task.buf)?;
            let (segment, offset) = block.to_seg_off();
            if task.flags.contains(TaskFlags::VBE_INFO_BLOCK)
                || task.flags.contains(TaskFlags::BUF_ES_DI)
            {
                regs.es = segment;
                regs.edi = offset as u32;
            }
            if task.flags.contains(TaskFlags::BUF_ES_BX) {
                regs.es = segment;
                regs.ebx = offset as u32;
            }
        }

        debug!(flags = ?task.flags, ax = regs.ax(), len = task.buf.len(), "running task");
        task.regs = self.backend.execute_interrupt(VIDEO_INTERRUPT, &regs)?;

        let ok = succeeded(task.regs.ax());
        debug!(ax = task.regs.ax(), ok, "task finished");
        let Some(block) = scratch else {
            return Ok(());
        };
        if !ok {
            return Ok(());
        }

        if task.flags.contains(TaskFlags::VBE_INFO_BLOCK) {
            self.backend.memory().read(block, &mut task.buf)?;
            relocate(&mut task.buf, block, self.backend.memory());
        } else if task.flags.contains(TaskFlags::BUF_RETURN) {
            self.backend.memory().read(block, &mut task.buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        relocate::PointerField,
        testing::{
            fabricated_engine, info_block_task, NullPorts, MODES, OEM_STRING, PRODUCT_REV,
            VENDOR_NAME,
        },
        vbe::{InfoBlock, ModeInfo, VBE_SUCCESS},
    };
    use v86_cpu::{CpuState, EmulatorBackend};

    fn field(buf: &[u8], field: PointerField) -> u32 {
        let at = field.offset();
        u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    fn live_blocks(engine: &Engine<EmulatorBackend<NullPorts>>) -> usize {
        engine
            .backend()
            .region_map()
            .pool()
            .map_or(0, |pool| pool.allocations().count())
    }

    #[test]
    fn info_block_with_exact_size_relocates_in_block_pointers() {
        let mut engine = fabricated_engine();
        let mut task = info_block_task(512);
        engine.run(&mut task).unwrap();

        assert_eq!(task.regs.ax(), VBE_SUCCESS);
        assert_eq!(&task.buf[..4], b"VESA");
        assert_eq!(field(&task.buf, PointerField::ModeList), 0x22);
        assert_eq!(field(&task.buf, PointerField::OemString), 0x100);
        assert_eq!(field(&task.buf, PointerField::OemVendorName), 0);
        assert_eq!(field(&task.buf, PointerField::OemProductName), 0);
        assert_eq!(field(&task.buf, PointerField::OemProductRev), 0);

        let ib = InfoBlock::parse(&task.buf).unwrap();
        assert_eq!(ib.modes().collect::<Vec<_>>(), MODES.to_vec());
        assert_eq!(ib.string(PointerField::OemString), Some(OEM_STRING));
    }

    #[test]
    fn info_block_tail_receives_rom_strings() {
        let mut engine = fabricated_engine();
        let mut task = info_block_task(1024);
        engine.run(&mut task).unwrap();

        assert_eq!(field(&task.buf, PointerField::OemVendorName), 512);
        assert_eq!(field(&task.buf, PointerField::OemProductRev), 523);
        assert_eq!(field(&task.buf, PointerField::OemProductName), 0);

        let ib = InfoBlock::parse(&task.buf).unwrap();
        assert_eq!(ib.string(PointerField::OemVendorName), Some(VENDOR_NAME));
        assert_eq!(ib.string(PointerField::OemProductRev), Some(PRODUCT_REV));
        assert_eq!(ib.total_memory(), 16 * 1024 * 1024);
    }

    #[test]
    fn scratch_is_released_after_every_call() {
        let mut engine = fabricated_engine();
        // Stack and return stub stay allocated for the backend's lifetime.
        let expected = live_blocks(&engine);
        assert_eq!(expected, 2);
        for task in [
            info_block_task(512),
            Task::new(
                TaskFlags::BUF_ES_DI | TaskFlags::BUF_RETURN,
                CpuState {
                    eax: 0x4F01,
                    ecx: 0x0118,
                    ..Default::default()
                },
                vec![0; 256],
            ),
            // Fails at BIOS level.
            Task::new(TaskFlags::BUF_ES_DI, CpuState { eax: 0x4F15, ..Default::default() }, vec![0; 128]),
        ] {
            let mut task = task;
            engine.run(&mut task).unwrap();
            assert_eq!(live_blocks(&engine), expected);
        }
    }

    #[test]
    fn mode_info_is_returned_through_es_di() {
        let mut engine = fabricated_engine();
        let mut task = Task::new(
            TaskFlags::BUF_ES_DI | TaskFlags::BUF_RETURN,
            CpuState {
                eax: 0x4F01,
                ecx: 0x0118,
                ..Default::default()
            },
            vec![0; 256],
        );
        engine.run(&mut task).unwrap();

        assert_eq!(task.regs.ax(), VBE_SUCCESS);
        assert_eq!(task.regs.cx(), 0x0118);
        let mode = ModeInfo::parse(&task.buf).unwrap();
        assert_eq!((mode.width, mode.height, mode.bits_per_pixel), (1024, 768, 32));
    }

    #[test]
    fn buffer_is_not_copied_back_without_return_flag() {
        let mut engine = fabricated_engine();
        let mut task = Task::new(
            TaskFlags::BUF_ES_DI,
            CpuState {
                eax: 0x4F01,
                ..Default::default()
            },
            vec![0xAA; 256],
        );
        engine.run(&mut task).unwrap();
        assert_eq!(task.regs.ax(), VBE_SUCCESS);
        assert!(task.buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn bios_failure_is_reported_in_ax_only() {
        let mut engine = fabricated_engine();
        let mut task = Task::new(
            TaskFlags::BUF_ES_DI | TaskFlags::BUF_RETURN,
            CpuState {
                eax: 0x4F0A,
                ..Default::default()
            },
            vec![0x55; 64],
        );
        engine.run(&mut task).unwrap();
        assert_eq!(task.regs.ax(), 0x014F);
        assert!(task.buf.iter().all(|&b| b == 0x55));
    }

    #[test]
    fn es_bx_placement_sets_bx_to_block_offset() {
        let mut engine = fabricated_engine();
        let mut task = Task::new(
            TaskFlags::BUF_ES_BX,
            CpuState {
                eax: 0x4F0A,
                ebx: 0xFFFF_FFFF,
                ..Default::default()
            },
            vec![0; 16],
        );
        engine.run(&mut task).unwrap();
        // The buffer lands right after the stack and the return stub.
        assert_eq!(task.regs.es, 0x1201);
        assert_eq!(task.regs.ebx, 0);
    }

    #[test]
    fn undersized_info_block_is_rejected_before_running() {
        let mut engine = fabricated_engine();
        let mut task = info_block_task(256);
        let err = engine.run(&mut task).unwrap_err();
        assert!(matches!(err, TaskError::InfoBlockTooSmall { len: 256 }));
        assert_eq!(task.regs.ax(), 0x4F00);
    }

    #[test]
    fn exhausted_pool_fails_the_task_only() {
        let mut engine = fabricated_engine();
        let hog = engine.backend_mut().memory_mut().alloc(0x1DC00).unwrap();

        let mut task = info_block_task(1024);
        let err = engine.run(&mut task).unwrap_err();
        assert!(err.is_exhausted());

        engine.backend_mut().memory_mut().free(hog).unwrap();
        let mut task = info_block_task(1024);
        engine.run(&mut task).unwrap();
        assert_eq!(task.regs.ax(), VBE_SUCCESS);
    }
}

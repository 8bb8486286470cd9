//! Software interpreter backend.

mod alu;
pub(crate) mod interp;

use tracing::{debug, trace};
use v86_mem::{RealModeMemory, RegionMap};

use crate::{
    backend::CallFrame, state::CpuState, BackendError, BackendKind, ExecutionBackend, PortIo,
};

use self::interp::{StepExit, SystemBus};

/// Instructions one call may execute before it is abandoned.
pub const DEFAULT_STEP_BUDGET: u64 = 50_000_000;

/// Runs BIOS code in the built-in interpreter against a [`RegionMap`].
///
/// Port accesses go through `P`; in production that is
/// [`HostPorts`](crate::HostPorts), tests plug in a recorder.
#[derive(Debug)]
pub struct EmulatorBackend<P> {
    memory: RegionMap,
    ports: P,
    frame: CallFrame,
    step_budget: u64,
}

impl<P: PortIo> EmulatorBackend<P> {
    /// Installs the call stack and return stub in the scratch pool of
    /// `memory`.
    pub fn new(mut memory: RegionMap, ports: P) -> Result<Self, BackendError> {
        let frame = CallFrame::install(&mut memory)?;
        Ok(Self {
            memory,
            ports,
            frame,
            step_budget: DEFAULT_STEP_BUDGET,
        })
    }

    pub fn with_step_budget(mut self, steps: u64) -> Self {
        self.step_budget = steps;
        self
    }

    pub fn step_budget(&self) -> u64 {
        self.step_budget
    }

    pub fn region_map(&self) -> &RegionMap {
        &self.memory
    }

    pub fn ports(&self) -> &P {
        &self.ports
    }

    pub fn ports_mut(&mut self) -> &mut P {
        &mut self.ports
    }
}

impl<P: PortIo> ExecutionBackend for EmulatorBackend<P> {
    fn kind(&self) -> BackendKind {
        BackendKind::Emulator
    }

    fn memory(&self) -> &dyn RealModeMemory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut dyn RealModeMemory {
        &mut self.memory
    }

    fn execute_interrupt(&mut self, vector: u8, regs: &CpuState) -> Result<CpuState, BackendError> {
        let mut cpu = self.frame.enter(&mut self.memory, vector, regs)?;
        debug!(vector, cs = cpu.cs, ip = cpu.ip(), "entering interrupt handler");

        let mut bus = SystemBus {
            memory: &mut self.memory,
            ports: &mut self.ports,
        };
        let mut steps = 0u64;
        while !self.frame.is_return(cpu.cs, cpu.eip) {
            if steps == self.step_budget {
                return Err(BackendError::StepLimit { steps });
            }
            steps += 1;
            match interp::step(&mut cpu, &mut bus)? {
                StepExit::Continue => {}
                StepExit::Halted { cs, ip } => return Err(BackendError::UnexpectedHalt { cs, ip }),
            }
        }

        trace!(vector, steps, ax = cpu.ax(), "interrupt handler returned");
        Ok(cpu)
    }
}

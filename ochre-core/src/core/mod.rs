//! The hart: fetch, decode, execute, writeback, trap delivery.

pub mod alu;
pub mod csr;
pub mod decode;
pub mod fetch;
pub mod lsu;
pub mod trap;

pub use decode::{StepRecord, WritebackSource};
pub use trap::Trap;

use crate::bus::Bus;
use crate::core::csr::CsrFile;
use crate::core::fetch::FetchCache;
use crate::registers::Registers;

/// A single RV32IM_Zicond hart running in machine mode.
///
/// [`step`](Self::step) advances the hart by exactly one architectural cycle
/// per call, whether the cycle commits, branches, or traps, and returns the
/// [`StepRecord`] describing everything the cycle did. The hart does not own
/// its memory; the bus is passed into each step so the platform can share it
/// with the debugger between cycles.
#[derive(Debug)]
pub struct Cpu {
    pub registers: Registers,
    pub pc: u32,
    pub csr: CsrFile,
    fetch: FetchCache,
}

impl Cpu {
    /// Creates a hart with cleared registers and the PC at `reset_pc`.
    pub fn new(reset_pc: u32) -> Self {
        Self {
            registers: Registers::new(),
            pc: reset_pc,
            csr: CsrFile::new(),
            fetch: FetchCache::new(),
        }
    }

    /// Executes one cycle and delivers its trap, if any. Ticks `mcycle` and
    /// `minstret` by exactly one.
    pub fn step(&mut self, bus: &mut dyn Bus) -> StepRecord {
        let record = self.execute(bus);
        self.deliver_trap(&record);
        self.csr.tick();
        record
    }

    fn execute(&mut self, bus: &mut dyn Bus) -> StepRecord {
        let mut record = StepRecord {
            pc: self.pc,
            ..StepRecord::default()
        };

        // Fetch.
        let inst = match self.fetch.fetch(bus, self.pc) {
            Ok(inst) => inst,
            Err(fault) => {
                record.trap = Some(fault);
                return record;
            }
        };
        record.inst = inst;

        // Decode.
        let mut record = match decode::decode(&self.registers, inst, self.pc) {
            Ok(record) => record,
            Err(fault) => {
                record.trap = Some(fault);
                return record;
            }
        };

        // Execute.
        if record.ecall {
            record.trap = Some(Trap::EnvCallFromMMode);
            return record;
        }

        if self.csr.mstatus.mie() {
            let pending = self.csr.mip & self.csr.mie;
            if pending & (1 << csr::MIP_MTIP_BIT) != 0 {
                record.trap = Some(Trap::MachineTimerInterrupt);
                return record;
            }
        }

        record.alu_result = alu::alu(record.alu_op, record.alu_x, record.alu_y);
        record.branch_taken = alu::branch(record.branch_op, record.branch_x, record.branch_y);

        match self.csr.access(record.csr_access) {
            Ok(value) => record.csr_result = value,
            Err(_) => {
                record.trap = Some(Trap::IllegalInstruction);
                return record;
            }
        }

        match lsu::load_store(
            bus,
            record.mem_op,
            record.mem_funct,
            record.alu_result,
            record.store_value,
        ) {
            Ok(value) => record.load_value = value,
            Err(fault) => {
                record.trap = Some(fault);
                return record;
            }
        }

        if record.fencei {
            self.fetch.fencei();
        }

        // Writeback.
        record.writeback_value = match record.writeback_source {
            WritebackSource::None => 0,
            WritebackSource::PcPlus4 => self.pc.wrapping_add(4),
            WritebackSource::Alu => record.alu_result,
            WritebackSource::Memory => record.load_value,
            WritebackSource::Csr => record.csr_result,
        };
        self.registers
            .set_x(record.dest_register, record.writeback_value);

        // PC update.
        if record.mret {
            self.pc = self.csr.mepc;
            let mpie = self.csr.mstatus.mpie();
            self.csr.mstatus.set_mie(mpie);
            self.csr.mstatus.set_mpie(false);
        } else if record.branch_taken {
            self.pc = record.alu_result;
        } else {
            self.pc = self.pc.wrapping_add(4);
        }

        record
    }

    /// Redirects through the M-mode trap CSRs if the cycle trapped.
    ///
    /// Every trap path leaves `self.pc` at the start-of-cycle value, so
    /// `mepc` can be taken from it directly.
    fn deliver_trap(&mut self, record: &StepRecord) {
        let Some(fault) = record.trap else {
            return;
        };

        let mie = self.csr.mstatus.mie();
        self.csr.mstatus.set_mpie(mie);
        self.csr.mstatus.set_mie(false);
        self.csr.mstatus.set_mpp(csr::PRIV_MACHINE);

        self.csr.mepc = self.pc;
        self.csr.mcause = fault.code();

        self.csr.mtval = match fault {
            Trap::InstAddressMisaligned
            | Trap::InstAccessFault
            | Trap::InstPageFault
            | Trap::LoadAddressMisaligned
            | Trap::LoadAccessFault
            | Trap::LoadPageFault
            | Trap::StoreAddressMisaligned
            | Trap::StoreAccessFault
            | Trap::StorePageFault => record.alu_result,
            Trap::IllegalInstruction => record.inst,
            _ => 0,
        };

        if fault.is_interrupt() && self.csr.mtvec_mode() == 1 {
            self.pc = (self.csr.mtvec_base() << 2).wrapping_add(4 * fault.exception_code());
        } else {
            self.pc = self.csr.mtvec_base() << 2;
        }
    }
}

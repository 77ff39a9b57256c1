//! Byte and register accessors binding the expression VM and the debug
//! transfer commands to the machine.

use crate::bus::Bus;
use crate::core::csr::{CsrAccess, CsrWriteMode};
use crate::core::Cpu;
use crate::registers::Specifier;
use crate::word::Word;

/// GDB register number of the program counter.
pub const REGNO_PC: u32 = 32;
/// First GDB register number of the CSR space; CSR address = regno - 128.
pub const REGNO_CSR_BASE: u32 = 128;

/// Byte-granular view of a word-oriented bus.
pub struct MemoryAccessor<'a> {
    pub bus: &'a mut dyn Bus,
}

impl MemoryAccessor<'_> {
    /// Reads one byte by extracting it from the containing aligned word.
    pub fn read(&mut self, address: u32) -> Option<u8> {
        let word = self.bus.read(u64::from(address & !0x3)).ok()?;
        Some(word.to_le_bytes()[(address & 0x3) as usize])
    }

    /// Writes one byte under a single-lane byte mask.
    pub fn write(&mut self, address: u32, value: u8) -> bool {
        let lane = address & 0x3;
        let mask: Word<4> = Word::new(1 << lane);
        let data = u32::from(value) << (lane * 8);
        self.bus.write(u64::from(address & !0x3), data, mask).is_ok()
    }
}

/// The debugger's register numbering over the hart's state.
///
/// Numbers 0..=31 are the GPRs, 32 is the PC, and 128 upward maps onto the
/// CSR address space.
pub struct RegisterAccessor<'a> {
    pub cpu: &'a mut Cpu,
}

impl RegisterAccessor<'_> {
    pub fn read(&mut self, regno: u32) -> Option<u32> {
        if let Some(specifier) = Specifier::new(regno) {
            return Some(self.cpu.registers.x(specifier));
        }
        if regno == REGNO_PC {
            return Some(self.cpu.pc);
        }
        if regno >= REGNO_CSR_BASE {
            let access = CsrAccess {
                write_mode: CsrWriteMode::None,
                address: Word::new(u64::from(regno - REGNO_CSR_BASE)),
                write_value: 0,
                read: true,
            };
            return self.cpu.csr.access(access).ok();
        }
        None
    }

    pub fn write(&mut self, regno: u32, value: u32) -> bool {
        if let Some(specifier) = Specifier::new(regno) {
            self.cpu.registers.set_x(specifier, value);
            return true;
        }
        if regno == REGNO_PC {
            self.cpu.pc = value;
            return true;
        }
        if regno >= REGNO_CSR_BASE {
            let access = CsrAccess {
                write_mode: CsrWriteMode::Overwrite,
                address: Word::new(u64::from(regno - REGNO_CSR_BASE)),
                write_value: value,
                read: true,
            };
            return self.cpu.csr.access(access).is_ok();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockMemory, FillPolicy};

    #[test]
    fn memory_accessor_byte_lanes() {
        let mut memory = BlockMemory::new(64, FillPolicy::Zero);
        let mut accessor = MemoryAccessor { bus: &mut memory };
        assert!(accessor.write(5, 0xab));
        assert_eq!(Some(0xab), accessor.read(5));
        assert_eq!(Some(0x00), accessor.read(4));
        assert_eq!(None, accessor.read(64));

        drop(accessor);
        assert_eq!(Ok(0x0000_ab00), crate::bus::Bus::read(&mut memory, 4));
    }

    #[test]
    fn register_accessor_numbering() {
        let mut cpu = Cpu::new(0x100);
        let mut accessor = RegisterAccessor { cpu: &mut cpu };

        assert!(accessor.write(1, 0xdead_beef));
        assert_eq!(Some(0xdead_beef), accessor.read(1));

        // x0 accepts the write request but stays zero.
        assert!(accessor.write(0, 1));
        assert_eq!(Some(0), accessor.read(0));

        assert_eq!(Some(0x100), accessor.read(REGNO_PC));
        assert!(accessor.write(REGNO_PC, 0x200));
        assert_eq!(Some(0x200), accessor.read(REGNO_PC));

        // CSRs live at regno 128 + address.
        assert!(accessor.write(REGNO_CSR_BASE + 0x340, 7));
        assert_eq!(Some(7), accessor.read(REGNO_CSR_BASE + 0x340));

        // The gap between PC and the CSR base is unmapped.
        assert_eq!(None, accessor.read(33));
        assert!(!accessor.write(64, 0));

        // Nonexistent CSRs report failure.
        assert_eq!(None, accessor.read(REGNO_CSR_BASE + 0x123));
    }
}

//! Breakpoints, watchpoints, and the address-range key they are indexed by.

use crate::bus::Bus;
use crate::core::Cpu;
use crate::gdb::accessor::{MemoryAccessor, RegisterAccessor};
use crate::gdb::expr;
use std::cmp::Ordering;

/// A `{start, size}` range used as an ordered-map key with
/// overlap-as-equivalent semantics.
///
/// Two ranges compare equal when either contains the other; a range is less
/// or greater only when it lies wholly on one side. This turns a
/// `BTreeMap<AddressRange, _>` lookup with a `{addr, access_size}` probe into
/// "find the watchpoint covering this access". Partially overlapping ranges
/// that contain neither each other are not orderable; they also compare
/// equal here, and inserting such ranges is unsupported (lookups among them
/// may miss).
#[derive(Debug, Copy, Clone)]
pub struct AddressRange {
    pub start: u32,
    pub size: u32,
}

impl Ord for AddressRange {
    fn cmp(&self, other: &Self) -> Ordering {
        let end = self.start.wrapping_add(self.size);
        let other_end = other.start.wrapping_add(other.size);

        if self.start <= other.start && other_end <= end {
            return Ordering::Equal;
        }
        if other.start <= self.start && end <= other_end {
            return Ordering::Equal;
        }
        if other_end < self.start {
            return Ordering::Greater;
        }
        if end < other.start {
            return Ordering::Less;
        }
        Ordering::Equal
    }
}

impl PartialOrd for AddressRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for AddressRange {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AddressRange {}

/// A data watchpoint.
#[derive(Debug, Clone)]
pub struct Watchpoint {
    pub watch_write: bool,
    pub watch_read: bool,
    pub range: AddressRange,
}

/// A hardware breakpoint with an optional conditional bytecode.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub address: u32,
    pub condition: Option<Vec<u8>>,
}

impl Breakpoint {
    /// Returns `true` if the stopped hart sits on this breakpoint and the
    /// condition (if any) evaluates non-zero. Evaluation errors count as not
    /// triggered.
    pub fn is_triggered_by(&self, cpu: &mut Cpu, bus: &mut dyn Bus) -> bool {
        if cpu.pc != self.address {
            return false;
        }
        let Some(condition) = &self.condition else {
            return true;
        };

        let mut memory = MemoryAccessor { bus };
        let mut registers = RegisterAccessor { cpu };
        let outcome = expr::execute(
            &mut |address| memory.read(address),
            &mut |regno| registers.read(regno),
            condition,
        );
        match outcome {
            Ok(outcome) => outcome.top != 0,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockMemory, FillPolicy};
    use crate::registers::Specifier;
    use crate::word::Word;
    use std::collections::BTreeMap;

    fn range(start: u32, size: u32) -> AddressRange {
        AddressRange { start, size }
    }

    #[test]
    fn containment_is_equivalence() {
        assert_eq!(range(0x100, 8), range(0x100, 8));
        assert_eq!(range(0x100, 8), range(0x102, 2));
        assert_eq!(range(0x102, 2), range(0x100, 8));
        assert!(range(0x100, 4) < range(0x200, 4));
        assert!(range(0x200, 4) > range(0x100, 4));
    }

    #[test]
    fn watchpoint_lookup_by_access() {
        let mut watchpoints: BTreeMap<AddressRange, Watchpoint> = BTreeMap::new();
        watchpoints.insert(
            range(0x1000, 16),
            Watchpoint {
                watch_write: true,
                watch_read: false,
                range: range(0x1000, 16),
            },
        );
        watchpoints.insert(
            range(0x8000, 4),
            Watchpoint {
                watch_write: false,
                watch_read: true,
                range: range(0x8000, 4),
            },
        );

        // A 4-byte access inside the first range resolves to it.
        let hit = watchpoints.get(&range(0x1008, 4)).unwrap();
        assert!(hit.watch_write);
        assert!(watchpoints.get(&range(0x0800, 4)).is_none());
        assert!(watchpoints.get(&range(0x8000, 1)).is_some());
        assert!(watchpoints.get(&range(0x9000, 4)).is_none());
    }

    #[test]
    fn unconditional_breakpoint_matches_pc() {
        let mut cpu = Cpu::new(0x40);
        let mut memory = BlockMemory::new(64, FillPolicy::Zero);
        let breakpoint = Breakpoint {
            address: 0x40,
            condition: None,
        };
        assert!(breakpoint.is_triggered_by(&mut cpu, &mut memory));
        cpu.pc = 0x44;
        assert!(!breakpoint.is_triggered_by(&mut cpu, &mut memory));
    }

    #[test]
    fn conditional_breakpoint_evaluates_bytecode() {
        let mut cpu = Cpu::new(0x40);
        let mut memory = BlockMemory::new(64, FillPolicy::Zero);
        memory.write(12, 3, Word::ONES).unwrap();
        cpu.registers.set_x(Specifier::new(1).unwrap(), 3);

        // reg 1 ; const8 12 ; ref32 ; equal ; end
        let condition = vec![0x26, 0x00, 0x01, 0x22, 12, 0x19, 0x13, 0x27];
        let breakpoint = Breakpoint {
            address: 0x40,
            condition: Some(condition),
        };
        assert!(breakpoint.is_triggered_by(&mut cpu, &mut memory));

        cpu.registers.set_x(Specifier::new(1).unwrap(), 4);
        assert!(!breakpoint.is_triggered_by(&mut cpu, &mut memory));

        // A condition that fails to evaluate never triggers.
        let broken = Breakpoint {
            address: 0x40,
            condition: Some(vec![0x01]),
        };
        assert!(!broken.is_triggered_by(&mut cpu, &mut memory));
    }
}

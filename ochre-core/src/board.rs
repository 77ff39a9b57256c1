//! Platform glue: the fixed memory map and the per-cycle step.

use crate::bus::{Bus, BusError};
use crate::core::{Cpu, StepRecord};
use crate::device::{BlockMemory, Clock, FillPolicy, Interconnect, Uart};
use thiserror::Error;

pub const UART_BASE: u64 = 0x0001_0000;
pub const CLOCK_BASE: u64 = 0x0001_1000;
pub const ROM_BASE: u64 = 0x0010_0000;
pub const RAM_BASE: u64 = 0x8000_0000;

pub const ROM_SIZE: u64 = 128 * 1024;
pub const RAM_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Execution starts at the bottom of ROM.
pub const RESET_PC: u32 = ROM_BASE as u32;

// The four regions are pairwise disjoint; `resolve` relies on it.
const_assert!(UART_BASE + 256 <= CLOCK_BASE);
const_assert!(CLOCK_BASE + 256 <= ROM_BASE);
const_assert!(ROM_BASE + ROM_SIZE <= RAM_BASE);
const_assert!(RAM_BASE + RAM_SIZE <= 1 << 32);

/// The four devices of the platform and their address decoding.
#[derive(Debug)]
pub struct SystemMap {
    pub rom: BlockMemory,
    pub ram: BlockMemory,
    pub uart: Uart,
    pub clock: Clock,
}

impl Interconnect for SystemMap {
    fn resolve(&mut self, address: u64) -> Result<(&mut dyn Bus, u64), BusError> {
        // RAM first: it is by far the hottest region.
        if (RAM_BASE..RAM_BASE + self.ram.size()).contains(&address) {
            return Ok((&mut self.ram as &mut dyn Bus, address - RAM_BASE));
        }
        if (ROM_BASE..ROM_BASE + self.rom.size()).contains(&address) {
            return Ok((&mut self.rom as &mut dyn Bus, address - ROM_BASE));
        }
        if (UART_BASE..UART_BASE + self.uart.size()).contains(&address) {
            return Ok((&mut self.uart as &mut dyn Bus, address - UART_BASE));
        }
        if (CLOCK_BASE..CLOCK_BASE + self.clock.size()).contains(&address) {
            return Ok((&mut self.clock as &mut dyn Bus, address - CLOCK_BASE));
        }
        Err(BusError::OutOfRange)
    }
}

/// A fully wired machine: one hart plus ROM, RAM, UART, and the timer.
#[derive(Debug)]
pub struct Board {
    pub cpu: Cpu,
    pub map: SystemMap,
}

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("flash image size ({size} bytes) exceeds ROM size ({capacity} bytes)")]
    FlashImageTooLarge { size: usize, capacity: u64 },
}

impl Board {
    /// Builds the platform, loads `flash` into ROM, and locks the ROM.
    pub fn new(flash: &[u8], ram_fill: FillPolicy) -> Result<Self, BoardError> {
        Self::with_uart(flash, ram_fill, Uart::new())
    }

    /// Same as [`new`](Self::new) with a caller-provided UART, so tests can
    /// capture its streams.
    pub fn with_uart(flash: &[u8], ram_fill: FillPolicy, uart: Uart) -> Result<Self, BoardError> {
        let mut rom = BlockMemory::new(ROM_SIZE, FillPolicy::None);
        if !rom.fill_data(flash) {
            return Err(BoardError::FlashImageTooLarge {
                size: flash.len(),
                capacity: ROM_SIZE,
            });
        }
        rom.lock();

        Ok(Self {
            cpu: Cpu::new(RESET_PC),
            map: SystemMap {
                rom,
                ram: BlockMemory::new(RAM_SIZE, ram_fill),
                uart,
                clock: Clock::new(),
            },
        })
    }

    /// Advances the machine by one architectural cycle: one CPU step, then
    /// one timer tick.
    pub fn step(&mut self) -> StepRecord {
        let record = self.cpu.step(&mut self.map);
        self.map.clock.tick(&mut self.cpu.csr.mip);
        record
    }

    /// Drops every RAM page, re-arming the fill policy. Used by the
    /// debugger's restart request.
    pub fn reset_ram(&mut self) {
        self.map.ram.reset_content();
    }
}

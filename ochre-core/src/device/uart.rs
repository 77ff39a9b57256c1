//! Memory-mapped UART peripheral.

use crate::bus::{Bus, BusError, PAGE_WORDS};
use crate::word::Word;
use std::fmt;
use std::io::{Read, Write};

const REG_TX: u64 = 0;
const REG_RX: u64 = 1;
const REG_CFG: u64 = 2;
const REG_STA: u64 = 3;

/// Character device with four word registers: TX, RX, CFG, and STA.
///
/// TX bytes are emitted on the output stream, RX pulls from the input
/// stream. STA bit 1 (TX ready) is hard-wired; bit 0 (RX ready) varies
/// randomly while the input stream has data left.
pub struct Uart {
    config: u32,
    input: Box<dyn Read + Send>,
    output: Box<dyn Write + Send>,
    input_exhausted: bool,
}

impl Uart {
    /// Creates a UART connected to the host's stdin and stderr.
    pub fn new() -> Self {
        Self::with_streams(Box::new(std::io::stdin()), Box::new(std::io::stderr()))
    }

    /// Creates a UART over arbitrary streams, e.g. for tests.
    pub fn with_streams(input: Box<dyn Read + Send>, output: Box<dyn Write + Send>) -> Self {
        Self {
            config: 0,
            input,
            output,
            input_exhausted: false,
        }
    }

    fn receive_byte(&mut self) -> u32 {
        if self.input_exhausted {
            return u32::MAX;
        }
        let mut byte = [0u8; 1];
        match self.input.read(&mut byte) {
            Ok(1) => u32::from(byte[0]),
            _ => {
                self.input_exhausted = true;
                u32::MAX
            }
        }
    }
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Uart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uart")
            .field("config", &self.config)
            .field("input_exhausted", &self.input_exhausted)
            .finish_non_exhaustive()
    }
}

impl Bus for Uart {
    fn read(&mut self, address: u64) -> Result<u32, BusError> {
        if address & 0x3 != 0 {
            return Err(BusError::Unaligned);
        }
        match address / 4 {
            REG_RX => Ok(self.receive_byte()),
            REG_CFG => Ok(self.config),
            REG_STA => {
                let rx_ready = !self.input_exhausted && rand::random::<bool>();
                Ok(0b10 | rx_ready as u32)
            }
            _ => {
                log::warn!("uart: read of invalid register at {address:#x}");
                Err(BusError::AccessFault)
            }
        }
    }

    fn read_page(&mut self, _address: u64, _out: &mut [u32; PAGE_WORDS]) -> Result<(), BusError> {
        Err(BusError::NotSupported)
    }

    fn write(&mut self, address: u64, data: u32, mask: Word<4>) -> Result<(), BusError> {
        if address & 0x3 != 0 {
            return Err(BusError::Unaligned);
        }
        match address / 4 {
            REG_TX => {
                if mask.value() & 0x1 == 1 {
                    let byte = [(data & 0xff) as u8];
                    let _ = self.output.write_all(&byte);
                    let _ = self.output.flush();
                }
                Ok(())
            }
            REG_CFG => {
                self.config = mask.expand_byte_mask::<32>().choose(data, self.config);
                log::debug!("uart: config set to {:#010x}", self.config);
                Ok(())
            }
            _ => {
                log::warn!("uart: write to invalid register at {address:#x}");
                Err(BusError::AccessFault)
            }
        }
    }

    fn size(&self) -> u64 {
        256
    }
}

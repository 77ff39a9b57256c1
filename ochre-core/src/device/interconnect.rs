//! Range-based dispatch from a flat address space onto devices.

use crate::bus::{Bus, BusError, PAGE_WORDS};
use crate::word::Word;

/// An address decoder over a set of devices.
///
/// Implementors only provide [`resolve`](Self::resolve); the [`Bus`]
/// operations are derived from it, so an interconnect can stand in anywhere a
/// single device could. An address that no region claims resolves to
/// [`BusError::OutOfRange`].
pub trait Interconnect {
    /// Maps an absolute address to the owning device and the address local
    /// to that device.
    fn resolve(&mut self, address: u64) -> Result<(&mut dyn Bus, u64), BusError>;
}

impl<T: Interconnect> Bus for T {
    fn read(&mut self, address: u64) -> Result<u32, BusError> {
        let (device, local) = self.resolve(address)?;
        device.read(local)
    }

    fn read_page(&mut self, address: u64, out: &mut [u32; PAGE_WORDS]) -> Result<(), BusError> {
        let (device, local) = self.resolve(address)?;
        device.read_page(local, out)
    }

    fn write(&mut self, address: u64, data: u32, mask: Word<4>) -> Result<(), BusError> {
        let (device, local) = self.resolve(address)?;
        device.write(local, data, mask)
    }

    fn size(&self) -> u64 {
        u64::MAX
    }
}

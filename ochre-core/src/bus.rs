//! The word-oriented memory interface shared by the CPU and all devices.

use crate::word::Word;
use thiserror::Error;

/// Number of 32-bit words in a fetch page (4 KiB).
pub const PAGE_WORDS: usize = 1024;

/// Interface for anything the CPU can read from or write to.
///
/// Addresses are 64-bit so an interconnect can span the full 32-bit physical
/// space without overflow at region arithmetic; data is always a 32-bit word.
/// Writes carry a 4-bit byte-enable mask (bit 0 selects the least significant
/// byte). Implementations decide alignment and range rules and report
/// violations through [`BusError`]; they must never panic on any
/// `(address, mask)` combination.
pub trait Bus {
    /// Reads the word at `address`.
    fn read(&mut self, address: u64) -> Result<u32, BusError>;

    /// Reads a full 4 KiB page into `out`. `address` must be page-aligned.
    fn read_page(&mut self, address: u64, out: &mut [u32; PAGE_WORDS]) -> Result<(), BusError>;

    /// Writes the bytes of `data` selected by `mask` to the word at
    /// `address`.
    fn write(&mut self, address: u64, data: u32, mask: Word<4>) -> Result<(), BusError>;

    /// The addressable size in bytes.
    fn size(&self) -> u64;
}

/// Ways a bus access can fail.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum BusError {
    /// The address lies outside the device or any mapped region.
    #[error("address out of range")]
    OutOfRange,
    /// The address violates the device's alignment requirements.
    #[error("unaligned access")]
    Unaligned,
    /// The device refused the access (e.g. write-locked memory).
    #[error("access fault")]
    AccessFault,
    /// The device is in a state in which it cannot complete the access.
    #[error("device error")]
    DeviceError,
    /// The device does not implement this kind of access.
    #[error("operation not supported")]
    NotSupported,
}

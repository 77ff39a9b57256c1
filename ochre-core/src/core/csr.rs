//! Machine-mode control and status registers.
//!
//! The hart only implements M-mode, so the CSR set is the machine-info
//! registers, the trap CSRs, and the base counters. Access goes through
//! [`CsrFile::access`], which applies the read/set/clear/overwrite semantics
//! of the Zicsr instructions and enforces the read-only address space
//! (`address[11:10] == 0b11`).

use crate::word::Word;
use bitvec::field::BitField;
use bitvec::order::Lsb0;
use bitvec::view::BitView;
use thiserror::Error;

pub const MSTATUS: u16 = 0x300;
pub const MISA: u16 = 0x301;
pub const MIE: u16 = 0x304;
pub const MTVEC: u16 = 0x305;
pub const MSTATUSH: u16 = 0x310;
pub const MSCRATCH: u16 = 0x340;
pub const MEPC: u16 = 0x341;
pub const MCAUSE: u16 = 0x342;
pub const MTVAL: u16 = 0x343;
pub const MIP: u16 = 0x344;
pub const MCYCLE: u16 = 0xb00;
pub const MINSTRET: u16 = 0xb02;
pub const MCYCLEH: u16 = 0xb80;
pub const MINSTRETH: u16 = 0xb82;
pub const MVENDORID: u16 = 0xf11;
pub const MARCHID: u16 = 0xf12;
pub const MIMPID: u16 = 0xf13;
pub const MHARTID: u16 = 0xf14;
pub const MCONFIGPTR: u16 = 0xf15;

/// Bit position of the machine timer interrupt pending flag in `mip`/`mie`.
pub const MIP_MTIP_BIT: u32 = 7;

/// `misa` reset value: MXL=32 with the I and M extension bits set.
pub const MISA_RESET: u32 = (1 << 30) | (1 << 8) | (1 << 12);

/// How a CSR instruction writes its target.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum CsrWriteMode {
    /// No write is performed.
    #[default]
    None,
    /// The write value replaces the whole register.
    Overwrite,
    /// Bits set in the write value are set in the register.
    Set,
    /// Bits set in the write value are cleared in the register.
    Clear,
}

/// One CSR access as decoded from a Zicsr instruction.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct CsrAccess {
    pub write_mode: CsrWriteMode,
    pub address: Word<12>,
    pub write_value: u32,
    pub read: bool,
}

/// Ways a CSR access can fail. Both become illegal-instruction traps.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsrError {
    #[error("CSR does not exist")]
    NotExists,
    #[error("write to read-only CSR")]
    WriteReadOnly,
}

/// The machine status register pair (`mstatus`/`mstatush`).
///
/// WARL discipline: only MIE, MPIE, and MPP are backed by state. Every other
/// field reads as zero no matter what was written; `mstatush` is entirely
/// hard-wired to zero.
#[derive(Debug, Clone)]
pub struct Mstatus {
    bits: u32,
}

/// Bit indices into mstatus.
mod idx {
    pub const MIE: usize = 3;
    pub const MPIE: usize = 7;
    pub const MPP: usize = 11;
}

/// The fields of mstatus that hold state: MIE, MPIE, and MPP.
const MSTATUS_WRITABLE: u32 = (1 << idx::MIE) | (1 << idx::MPIE) | (0b11 << idx::MPP);

/// MPP encoding of machine mode.
pub const PRIV_MACHINE: u8 = 0b11;

impl Default for Mstatus {
    fn default() -> Self {
        Self::new()
    }
}

impl Mstatus {
    /// Reset state: all fields clear except MPP, which holds machine mode.
    pub fn new() -> Self {
        let mut status = Self { bits: 0 };
        status.set_mpp(PRIV_MACHINE);
        status
    }

    /// Returns the MIE (machine interrupt enable) bit.
    pub fn mie(&self) -> bool {
        self.bits.view_bits::<Lsb0>()[idx::MIE]
    }

    pub fn set_mie(&mut self, value: bool) {
        self.bits.view_bits_mut::<Lsb0>().set(idx::MIE, value);
    }

    /// Returns the MPIE (machine previous interrupt enable) bit.
    pub fn mpie(&self) -> bool {
        self.bits.view_bits::<Lsb0>()[idx::MPIE]
    }

    pub fn set_mpie(&mut self, value: bool) {
        self.bits.view_bits_mut::<Lsb0>().set(idx::MPIE, value);
    }

    /// Returns the raw 2-bit MPP (machine previous privilege) field.
    pub fn mpp(&self) -> u8 {
        self.bits.view_bits::<Lsb0>()[idx::MPP..idx::MPP + 2].load_le()
    }

    pub fn set_mpp(&mut self, value: u8) {
        self.bits.view_bits_mut::<Lsb0>()[idx::MPP..idx::MPP + 2].store_le(value & 0b11);
    }

    /// The architectural value of the low half.
    pub fn low(&self) -> u32 {
        self.bits
    }

    fn write_low(&mut self, value: u32, mask: u32) -> u32 {
        self.bits = (self.bits & !mask) | (value & mask);
        self.force_legal();
        self.bits
    }

    /// Forces all unimplemented fields back to zero (WARL).
    fn force_legal(&mut self) {
        self.bits &= MSTATUS_WRITABLE;
    }
}

/// CSR type classification served to the debugger.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsrKind {
    Int,
    DataPtr,
    CodePtr,
}

/// Address, name, and type of one implemented CSR, for the debug stub.
#[derive(Debug, Copy, Clone)]
pub struct CsrMetadata {
    pub address: u16,
    pub name: &'static str,
    pub kind: CsrKind,
}

const fn meta(address: u16, name: &'static str, kind: CsrKind) -> CsrMetadata {
    CsrMetadata {
        address,
        name,
        kind,
    }
}

/// All implemented CSRs, ordered by address. Drives the `g`/`G` register
/// enumeration and the generated CSR feature XML.
pub const METADATA: [CsrMetadata; 19] = [
    meta(MSTATUS, "mstatus", CsrKind::Int),
    meta(MISA, "misa", CsrKind::Int),
    meta(MIE, "mie", CsrKind::Int),
    meta(MTVEC, "mtvec", CsrKind::Int),
    meta(MSTATUSH, "mstatush", CsrKind::Int),
    meta(MSCRATCH, "mscratch", CsrKind::Int),
    meta(MEPC, "mepc", CsrKind::CodePtr),
    meta(MCAUSE, "mcause", CsrKind::Int),
    meta(MTVAL, "mtval", CsrKind::Int),
    meta(MIP, "mip", CsrKind::Int),
    meta(MCYCLE, "mcycle", CsrKind::Int),
    meta(MINSTRET, "minstret", CsrKind::Int),
    meta(MCYCLEH, "mcycleh", CsrKind::Int),
    meta(MINSTRETH, "minstreth", CsrKind::Int),
    meta(MVENDORID, "mvendorid", CsrKind::Int),
    meta(MARCHID, "marchid", CsrKind::Int),
    meta(MIMPID, "mimpid", CsrKind::Int),
    meta(MHARTID, "mhartid", CsrKind::Int),
    meta(MCONFIGPTR, "mconfigptr", CsrKind::DataPtr),
];

/// The hart's CSR state plus the access engine over it.
#[derive(Debug, Clone)]
pub struct CsrFile {
    pub mvendorid: u32,
    pub marchid: u32,
    pub mimpid: u32,
    pub mhartid: u32,
    pub mconfigptr: u32,
    pub misa: u32,
    pub mscratch: u32,
    pub mcycle: u64,
    pub minstret: u64,
    pub mstatus: Mstatus,
    pub mepc: u32,
    pub mcause: u32,
    pub mtval: u32,
    pub mip: u32,
    pub mie: u32,
    pub mtvec: u32,
}

impl Default for CsrFile {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrFile {
    pub fn new() -> Self {
        Self {
            mvendorid: 0,
            marchid: 0,
            mimpid: 0,
            mhartid: 0,
            mconfigptr: 0,
            misa: MISA_RESET,
            mscratch: 0,
            mcycle: 0,
            minstret: 0,
            mstatus: Mstatus::new(),
            mepc: 0,
            mcause: 0,
            mtval: 0,
            mip: 0,
            mie: 0,
            mtvec: 0,
        }
    }

    /// The mtvec mode field: `0` direct, `1` vectored (raw, not legalized).
    pub fn mtvec_mode(&self) -> u32 {
        self.mtvec & 0b11
    }

    /// The word-aligned upper 30 bits of the trap vector base.
    pub fn mtvec_base(&self) -> u32 {
        self.mtvec >> 2
    }

    /// Increments the cycle and retired-instruction counters by one.
    pub fn tick(&mut self) {
        self.mcycle = self.mcycle.wrapping_add(1);
        self.minstret = self.minstret.wrapping_add(1);
    }

    /// Performs one CSR access.
    ///
    /// Returns the value read (the pre-write value, except for `mstatus`,
    /// which reports its legalized post-write state), or `0` when
    /// `access.read` is not set. Accessing an unimplemented CSR yields
    /// [`CsrError::NotExists`]; a non-empty write to a read-only address
    /// yields [`CsrError::WriteReadOnly`].
    pub fn access(&mut self, access: CsrAccess) -> Result<u32, CsrError> {
        let (value, mask) = match access.write_mode {
            CsrWriteMode::None => (0, 0),
            CsrWriteMode::Overwrite => (access.write_value, u32::MAX),
            CsrWriteMode::Set => (u32::MAX, access.write_value),
            CsrWriteMode::Clear => (0, access.write_value),
        };

        let writable = access.address.slice::<11, 10, 2>() != 0b11;
        if !writable && mask != 0 {
            return Err(CsrError::WriteReadOnly);
        }

        if !access.read && access.write_mode == CsrWriteMode::None {
            return Ok(0);
        }

        let write = |register: &mut u32| -> u32 {
            let previous = *register;
            *register = (previous & !mask) | (value & mask);
            previous
        };

        Ok(match access.address.as_u32() as u16 {
            MSCRATCH => write(&mut self.mscratch),
            MISA => write(&mut self.misa),
            MVENDORID => write(&mut self.mvendorid),
            MARCHID => write(&mut self.marchid),
            MIMPID => write(&mut self.mimpid),
            MHARTID => write(&mut self.mhartid),
            MCONFIGPTR => write(&mut self.mconfigptr),
            MCYCLE => write_u64_low(&mut self.mcycle, value, mask),
            MCYCLEH => write_u64_high(&mut self.mcycle, value, mask),
            MINSTRET => write_u64_low(&mut self.minstret, value, mask),
            MINSTRETH => write_u64_high(&mut self.minstret, value, mask),
            MEPC => write(&mut self.mepc),
            MCAUSE => write(&mut self.mcause),
            MTVAL => write(&mut self.mtval),
            MIP => write(&mut self.mip),
            MIE => write(&mut self.mie),
            MTVEC => write(&mut self.mtvec),
            MSTATUS => self.mstatus.write_low(value, mask),
            // The whole high half is WARL-zero.
            MSTATUSH => 0,
            _ => return Err(CsrError::NotExists),
        })
    }
}

fn write_u64_low(register: &mut u64, value: u32, mask: u32) -> u32 {
    let previous = *register as u32;
    let updated = (previous & !mask) | (value & mask);
    *register = (*register & 0xffff_ffff_0000_0000) | u64::from(updated);
    previous
}

fn write_u64_high(register: &mut u64, value: u32, mask: u32) -> u32 {
    let previous = (*register >> 32) as u32;
    let updated = (previous & !mask) | (value & mask);
    *register = (*register & 0x0000_0000_ffff_ffff) | (u64::from(updated) << 32);
    previous
}

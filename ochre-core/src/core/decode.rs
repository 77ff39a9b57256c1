//! Instruction decode: opcode dispatch into a uniform step record.

use crate::core::alu::{AluOp, BranchOp};
use crate::core::csr::{CsrAccess, CsrWriteMode};
use crate::core::lsu::{MemFunct, MemOp};
use crate::core::trap::Trap;
use crate::registers::{Registers, Specifier};
use crate::word::Word;

/// Where the writeback stage takes its value from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum WritebackSource {
    #[default]
    None,
    /// The link value `pc + 4`.
    PcPlus4,
    Alu,
    Memory,
    Csr,
}

/// Everything one cycle produces: control signals filled in by the decoder,
/// results filled in by the execute and writeback stages.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepRecord {
    pub pc: u32,
    pub inst: u32,

    pub writeback_source: WritebackSource,
    pub dest_register: Specifier,

    pub alu_op: AluOp,
    pub alu_x: u32,
    pub alu_y: u32,

    pub branch_op: BranchOp,
    pub branch_x: u32,
    pub branch_y: u32,

    pub mem_op: MemOp,
    pub mem_funct: MemFunct,
    pub store_value: u32,

    pub csr_access: CsrAccess,

    pub fencei: bool,
    pub ecall: bool,
    pub mret: bool,

    pub alu_result: u32,
    pub branch_taken: bool,
    pub csr_result: u32,
    pub load_value: u32,
    pub writeback_value: u32,

    pub trap: Option<Trap>,
}

// Opcode field values (instruction bits [6:2]).
const OPCODE_LUI: u32 = 0b01101;
const OPCODE_AUIPC: u32 = 0b00101;
const OPCODE_JAL: u32 = 0b11011;
const OPCODE_JALR: u32 = 0b11001;
const OPCODE_BRANCH: u32 = 0b11000;
const OPCODE_LOAD: u32 = 0b00000;
const OPCODE_STORE: u32 = 0b01000;
const OPCODE_OP_IMM: u32 = 0b00100;
const OPCODE_OP: u32 = 0b01100;
const OPCODE_MISC_MEM: u32 = 0b00011;
const OPCODE_SYSTEM: u32 = 0b11100;

fn rd(inst: Word<32>) -> Specifier {
    Specifier::from_field(inst.slice::<11, 7, 5>())
}

fn rs1(inst: Word<32>) -> Specifier {
    Specifier::from_field(inst.slice::<19, 15, 5>())
}

fn rs2(inst: Word<32>) -> Specifier {
    Specifier::from_field(inst.slice::<24, 20, 5>())
}

fn funct3(inst: Word<32>) -> u32 {
    inst.slice::<14, 12, 3>().as_u32()
}

/// The 12-bit I-immediate, sign-extended.
fn i_imm(inst: Word<32>) -> u32 {
    inst.slice::<31, 20, 12>().sext::<32>().as_u32()
}

/// The 12-bit S-immediate, assembled from its two fields and sign-extended.
fn s_imm(inst: Word<32>) -> u32 {
    inst.slice::<31, 25, 7>()
        .concat::<5, 12>(inst.slice::<11, 7, 5>())
        .sext::<32>()
        .as_u32()
}

/// The 13-bit B-immediate (always even), sign-extended.
fn b_imm(inst: Word<32>) -> u32 {
    inst.bit::<31>()
        .concat::<1, 2>(inst.bit::<7>())
        .concat::<6, 8>(inst.slice::<30, 25, 6>())
        .concat::<4, 12>(inst.slice::<11, 8, 4>())
        .concat::<1, 13>(Word::ZERO)
        .sext::<32>()
        .as_u32()
}

/// The U-immediate: instruction bits [31:12] over twelve zeros.
fn u_imm(inst: Word<32>) -> u32 {
    inst.slice::<31, 12, 20>()
        .concat::<12, 32>(Word::ZERO)
        .as_u32()
}

/// The 21-bit J-immediate (always even), sign-extended.
fn j_imm(inst: Word<32>) -> u32 {
    inst.bit::<31>()
        .concat::<8, 9>(inst.slice::<19, 12, 8>())
        .concat::<1, 10>(inst.bit::<20>())
        .concat::<10, 20>(inst.slice::<30, 21, 10>())
        .concat::<1, 21>(Word::ZERO)
        .sext::<32>()
        .as_u32()
}

fn decode_lui(inst: Word<32>) -> StepRecord {
    StepRecord {
        writeback_source: WritebackSource::Alu,
        dest_register: rd(inst),
        alu_op: AluOp::Add,
        alu_x: u_imm(inst),
        alu_y: 0,
        ..StepRecord::default()
    }
}

fn decode_auipc(inst: Word<32>, pc: u32) -> StepRecord {
    StepRecord {
        writeback_source: WritebackSource::Alu,
        dest_register: rd(inst),
        alu_op: AluOp::Add,
        alu_x: pc,
        alu_y: u_imm(inst),
        ..StepRecord::default()
    }
}

fn decode_jal(inst: Word<32>, pc: u32) -> StepRecord {
    StepRecord {
        writeback_source: WritebackSource::PcPlus4,
        dest_register: rd(inst),
        alu_op: AluOp::Add,
        alu_x: pc,
        alu_y: j_imm(inst),
        // An always-taken branch: the PC update stage redirects to the ALU
        // result whenever the branch unit reports taken.
        branch_op: BranchOp::Eq,
        ..StepRecord::default()
    }
}

fn decode_jalr(registers: &Registers, inst: Word<32>) -> StepRecord {
    StepRecord {
        writeback_source: WritebackSource::PcPlus4,
        dest_register: rd(inst),
        alu_op: AluOp::Add,
        alu_x: registers.x(rs1(inst)),
        alu_y: i_imm(inst),
        branch_op: BranchOp::Eq,
        ..StepRecord::default()
    }
}

fn decode_load(registers: &Registers, inst: Word<32>) -> StepRecord {
    const FUNCTS: [MemFunct; 8] = [
        MemFunct::LoadByte,
        MemFunct::LoadHalfword,
        MemFunct::LoadWord,
        MemFunct::None,
        MemFunct::LoadByteUnsigned,
        MemFunct::LoadHalfwordUnsigned,
        MemFunct::None,
        MemFunct::None,
    ];
    StepRecord {
        writeback_source: WritebackSource::Memory,
        dest_register: rd(inst),
        alu_op: AluOp::Add,
        alu_x: registers.x(rs1(inst)),
        alu_y: i_imm(inst),
        mem_op: MemOp::Load,
        mem_funct: FUNCTS[funct3(inst) as usize],
        ..StepRecord::default()
    }
}

fn decode_store(registers: &Registers, inst: Word<32>) -> StepRecord {
    let mem_funct = match funct3(inst) {
        0b000 => MemFunct::StoreByte,
        0b001 => MemFunct::StoreHalfword,
        0b010 => MemFunct::StoreWord,
        _ => MemFunct::None,
    };
    StepRecord {
        alu_op: AluOp::Add,
        alu_x: registers.x(rs1(inst)),
        alu_y: s_imm(inst),
        mem_op: MemOp::Store,
        mem_funct,
        store_value: registers.x(rs2(inst)),
        ..StepRecord::default()
    }
}

fn decode_op_imm(registers: &Registers, inst: Word<32>) -> StepRecord {
    let shift_right = if inst.bit::<30>().as_bool() {
        AluOp::Sra
    } else {
        AluOp::Srl
    };
    const fn table(shift_right: AluOp) -> [AluOp; 8] {
        [
            AluOp::Add,
            AluOp::Sll,
            AluOp::Slt,
            AluOp::Sltu,
            AluOp::Xor,
            shift_right,
            AluOp::Or,
            AluOp::And,
        ]
    }
    StepRecord {
        writeback_source: WritebackSource::Alu,
        dest_register: rd(inst),
        alu_op: table(shift_right)[funct3(inst) as usize],
        alu_x: registers.x(rs1(inst)),
        alu_y: i_imm(inst),
        ..StepRecord::default()
    }
}

fn decode_op(registers: &Registers, inst: Word<32>) -> Result<StepRecord, Trap> {
    let bit30 = inst.bit::<30>().as_bool();
    let alu_op = match inst.slice::<27, 25, 3>().as_u32() {
        // RV32I
        0b000 => [
            if bit30 { AluOp::Sub } else { AluOp::Add },
            AluOp::Sll,
            AluOp::Slt,
            AluOp::Sltu,
            AluOp::Xor,
            if bit30 { AluOp::Sra } else { AluOp::Srl },
            AluOp::Or,
            AluOp::And,
        ][funct3(inst) as usize],
        // RV32M
        0b001 => [
            AluOp::Mul,
            AluOp::Mulh,
            AluOp::Mulhsu,
            AluOp::Mulhu,
            AluOp::Div,
            AluOp::Divu,
            AluOp::Rem,
            AluOp::Remu,
        ][funct3(inst) as usize],
        // Zicond
        0b111 => match funct3(inst) {
            0b101 => AluOp::CzeroEqz,
            0b111 => AluOp::CzeroNez,
            _ => return Err(Trap::IllegalInstruction),
        },
        _ => return Err(Trap::IllegalInstruction),
    };
    Ok(StepRecord {
        writeback_source: WritebackSource::Alu,
        dest_register: rd(inst),
        alu_op,
        alu_x: registers.x(rs1(inst)),
        alu_y: registers.x(rs2(inst)),
        ..StepRecord::default()
    })
}

fn decode_branch(registers: &Registers, inst: Word<32>, pc: u32) -> StepRecord {
    const CONDITIONS: [BranchOp; 8] = [
        BranchOp::Eq,
        BranchOp::Ne,
        BranchOp::None,
        BranchOp::None,
        BranchOp::Lt,
        BranchOp::Ge,
        BranchOp::Ltu,
        BranchOp::Geu,
    ];
    StepRecord {
        alu_op: AluOp::Add,
        alu_x: pc,
        alu_y: b_imm(inst),
        branch_op: CONDITIONS[funct3(inst) as usize],
        branch_x: registers.x(rs1(inst)),
        branch_y: registers.x(rs2(inst)),
        ..StepRecord::default()
    }
}

fn decode_misc_mem(inst: Word<32>) -> Result<StepRecord, Trap> {
    if funct3(inst) == 0b001 {
        Ok(StepRecord {
            fencei: true,
            ..StepRecord::default()
        })
    } else {
        Err(Trap::IllegalInstruction)
    }
}

fn decode_system(registers: &Registers, inst: Word<32>) -> Result<StepRecord, Trap> {
    let mut record = StepRecord::default();

    if funct3(inst) == 0b000 {
        match inst.slice::<31, 20, 12>().as_u32() {
            0b0000_0000_0000 => record.ecall = true,
            0b0011_0000_0010 => record.mret = true,
            _ => return Err(Trap::IllegalInstruction),
        }
        return Ok(record);
    }

    match funct3(inst) {
        0b001..=0b011 | 0b101..=0b111 => record.writeback_source = WritebackSource::Csr,
        _ => return Err(Trap::IllegalInstruction),
    }

    let rs1_field = inst.slice::<19, 15, 5>();
    let csr_do_write = rs1_field != 0;

    record.csr_access.address = inst.slice::<31, 20, 12>();
    record.csr_access.write_value = if funct3(inst) & 0b100 != 0 {
        // Immediate variant: the rs1 field is the operand.
        rs1_field.sext::<32>().as_u32()
    } else {
        registers.x(rs1(inst))
    };
    record.dest_register = rd(inst);

    match funct3(inst) & 0b11 {
        // csrrw / csrrwi: read only when rd is named.
        0b01 => {
            record.csr_access.write_mode = if csr_do_write {
                CsrWriteMode::Overwrite
            } else {
                CsrWriteMode::None
            };
            record.csr_access.read = rd(inst) != Specifier::X0;
        }
        // csrrs / csrrsi always read.
        0b10 => {
            record.csr_access.write_mode = if csr_do_write {
                CsrWriteMode::Set
            } else {
                CsrWriteMode::None
            };
            record.csr_access.read = true;
        }
        // csrrc / csrrci always read.
        0b11 => {
            record.csr_access.write_mode = if csr_do_write {
                CsrWriteMode::Clear
            } else {
                CsrWriteMode::None
            };
            record.csr_access.read = true;
        }
        _ => return Err(Trap::IllegalInstruction),
    }

    Ok(record)
}

/// Decodes `inst`, reading source operands from `registers`.
///
/// Returns the step record with all control fields populated, or the trap to
/// deliver for an unsupported encoding. The 16-bit compressed subset is not
/// implemented, so any instruction without `11` in its low two bits is
/// illegal.
pub fn decode(registers: &Registers, inst: u32, pc: u32) -> Result<StepRecord, Trap> {
    let word = Word::<32>::new(u64::from(inst));

    if word.slice::<1, 0, 2>() != 0b11 {
        return Err(Trap::IllegalInstruction);
    }

    let mut record = match word.slice::<6, 2, 5>().as_u32() {
        OPCODE_LUI => decode_lui(word),
        OPCODE_AUIPC => decode_auipc(word, pc),
        OPCODE_JAL => decode_jal(word, pc),
        OPCODE_JALR => decode_jalr(registers, word),
        OPCODE_LOAD => decode_load(registers, word),
        OPCODE_STORE => decode_store(registers, word),
        OPCODE_OP_IMM => decode_op_imm(registers, word),
        OPCODE_OP => decode_op(registers, word)?,
        OPCODE_BRANCH => decode_branch(registers, word, pc),
        OPCODE_MISC_MEM => decode_misc_mem(word)?,
        OPCODE_SYSTEM => decode_system(registers, word)?,
        _ => return Err(Trap::IllegalInstruction),
    };

    record.pc = pc;
    record.inst = inst;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registers_with(values: &[(u32, u32)]) -> Registers {
        let mut registers = Registers::new();
        for &(index, value) in values {
            registers.set_x(Specifier::new(index).unwrap(), value);
        }
        registers
    }

    #[test]
    fn addi_negative_immediate() {
        // addi x1, x0, -1
        let record = decode(&Registers::new(), 0xfff0_0093, 0).unwrap();
        assert_eq!(WritebackSource::Alu, record.writeback_source);
        assert_eq!(Specifier::new(1).unwrap(), record.dest_register);
        assert_eq!(AluOp::Add, record.alu_op);
        assert_eq!(0, record.alu_x);
        assert_eq!(0xffff_ffff, record.alu_y);
    }

    #[test]
    fn lui_and_auipc() {
        // lui x5, 0x12345
        let record = decode(&Registers::new(), 0x1234_52b7, 0x40).unwrap();
        assert_eq!(0x1234_5000, record.alu_x);
        assert_eq!(0, record.alu_y);

        // auipc x5, 0x12345
        let record = decode(&Registers::new(), 0x1234_5297, 0x40).unwrap();
        assert_eq!(0x40, record.alu_x);
        assert_eq!(0x1234_5000, record.alu_y);
    }

    #[test]
    fn jal_is_taken_branch_to_alu_target() {
        // jal x1, 8
        let record = decode(&Registers::new(), 0x0080_00ef, 0x100).unwrap();
        assert_eq!(WritebackSource::PcPlus4, record.writeback_source);
        assert_eq!(0x100, record.alu_x);
        assert_eq!(8, record.alu_y);
        assert_eq!(BranchOp::Eq, record.branch_op);
        assert_eq!((0, 0), (record.branch_x, record.branch_y));
    }

    #[test]
    fn branch_backwards() {
        // beq x1, x2, -4
        let registers = registers_with(&[(1, 7), (2, 7)]);
        let record = decode(&registers, 0xfe20_8ee3, 0x100).unwrap();
        assert_eq!(BranchOp::Eq, record.branch_op);
        assert_eq!(0x100, record.alu_x);
        assert_eq!((-4_i32) as u32, record.alu_y);
        assert_eq!((7, 7), (record.branch_x, record.branch_y));
    }

    #[test]
    fn undefined_branch_condition_never_fires() {
        // funct3 = 010 in the branch major opcode
        let record = decode(&Registers::new(), 0x0020_a063, 0).unwrap();
        assert_eq!(BranchOp::None, record.branch_op);
    }

    #[test]
    fn loads_and_stores() {
        let registers = registers_with(&[(1, 0x1234_5678), (2, 0x8000_0000)]);

        // sw x1, 0(x2)
        let record = decode(&registers, 0x0011_2023, 0).unwrap();
        assert_eq!(MemOp::Store, record.mem_op);
        assert_eq!(MemFunct::StoreWord, record.mem_funct);
        assert_eq!(0x8000_0000, record.alu_x);
        assert_eq!(0x1234_5678, record.store_value);
        assert_eq!(WritebackSource::None, record.writeback_source);

        // lbu x3, 1(x2)
        let record = decode(&registers, 0x0011_4183, 0).unwrap();
        assert_eq!(MemOp::Load, record.mem_op);
        assert_eq!(MemFunct::LoadByteUnsigned, record.mem_funct);
        assert_eq!(WritebackSource::Memory, record.writeback_source);

        // An undefined load width decodes to the `None` funct.
        let record = decode(&registers, 0x0001_3003, 0).unwrap();
        assert_eq!(MemFunct::None, record.mem_funct);
    }

    #[test]
    fn m_extension_and_zicond() {
        // mul x3, x1, x2
        let record = decode(&Registers::new(), 0x0220_81b3, 0).unwrap();
        assert_eq!(AluOp::Mul, record.alu_op);

        // czero.eqz x1, x2, x3
        let record = decode(&Registers::new(), 0x0e31_50b3, 0).unwrap();
        assert_eq!(AluOp::CzeroEqz, record.alu_op);

        // czero with an undefined funct3 is illegal.
        assert_eq!(
            Err(Trap::IllegalInstruction),
            decode(&Registers::new(), 0x0e31_00b3, 0)
        );

        // Undefined funct7 family is illegal.
        assert_eq!(
            Err(Trap::IllegalInstruction),
            decode(&Registers::new(), 0x0430_81b3, 0)
        );
    }

    #[test]
    fn system_encodings() {
        let record = decode(&Registers::new(), 0x0000_0073, 0).unwrap();
        assert!(record.ecall);

        let record = decode(&Registers::new(), 0x3020_0073, 0).unwrap();
        assert!(record.mret);

        assert_eq!(
            Err(Trap::IllegalInstruction),
            decode(&Registers::new(), 0x1050_0073, 0) // wfi
        );
    }

    #[test]
    fn csr_read_write_flags() {
        let registers = registers_with(&[(2, 0xabcd)]);

        // csrrw x0, mscratch, x2: write only
        let record = decode(&registers, 0x3401_1073, 0).unwrap();
        assert_eq!(CsrWriteMode::Overwrite, record.csr_access.write_mode);
        assert!(!record.csr_access.read);
        assert_eq!(0xabcd, record.csr_access.write_value);
        assert_eq!(0x340, record.csr_access.address.value());

        // csrrs x1, mscratch, x0: read only
        let record = decode(&registers, 0x3400_20f3, 0).unwrap();
        assert_eq!(CsrWriteMode::None, record.csr_access.write_mode);
        assert!(record.csr_access.read);

        // csrrc x1, mscratch, x2
        let record = decode(&registers, 0x3401_30f3, 0).unwrap();
        assert_eq!(CsrWriteMode::Clear, record.csr_access.write_mode);
        assert!(record.csr_access.read);
    }

    #[test]
    fn csr_immediate_is_sign_extended_rs1_field() {
        // csrrwi x1, mscratch, 31: the 5-bit field sign-extends.
        let record = decode(&Registers::new(), 0x340f_d0f3, 0).unwrap();
        assert_eq!(CsrWriteMode::Overwrite, record.csr_access.write_mode);
        assert_eq!(0xffff_ffff, record.csr_access.write_value);

        // csrrsi x1, mscratch, 7
        let record = decode(&Registers::new(), 0x3403_e0f3, 0).unwrap();
        assert_eq!(CsrWriteMode::Set, record.csr_access.write_mode);
        assert_eq!(7, record.csr_access.write_value);
    }

    #[test]
    fn fence_i() {
        let record = decode(&Registers::new(), 0x0000_100f, 0).unwrap();
        assert!(record.fencei);
        // Plain fence (funct3 = 000) is not implemented.
        assert_eq!(
            Err(Trap::IllegalInstruction),
            decode(&Registers::new(), 0x0ff0_000f, 0)
        );
    }

    #[test]
    fn compressed_and_empty_words_are_illegal() {
        assert_eq!(
            Err(Trap::IllegalInstruction),
            decode(&Registers::new(), 0x0000_0000, 0)
        );
        assert_eq!(
            Err(Trap::IllegalInstruction),
            decode(&Registers::new(), 0x0000_4501, 0)
        );
    }

    #[test]
    fn record_carries_pc_and_inst() {
        let record = decode(&Registers::new(), 0x0000_0013, 0x80).unwrap(); // nop
        assert_eq!(0x80, record.pc);
        assert_eq!(0x0000_0013, record.inst);
    }
}

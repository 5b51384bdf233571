//! Decoded-instruction model shared by the recompiler front-end and the
//! full-semantics fallback interpreter.

use core::fmt;

use crate::opcode_tables::OpFlags;

/// Guest code width the decoder operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeMode {
    Bits16,
    Bits32,
    Bits64,
}

impl DecodeMode {
    pub const fn bitness(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 16,
            DecodeMode::Bits32 => 32,
            DecodeMode::Bits64 => 64,
        }
    }

    pub const fn from_bitness(bitness: u32) -> Option<Self> {
        match bitness {
            16 => Some(DecodeMode::Bits16),
            32 => Some(DecodeMode::Bits32),
            64 => Some(DecodeMode::Bits64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegmentReg {
    pub const ALL: [SegmentReg; 6] = [
        SegmentReg::Es,
        SegmentReg::Cs,
        SegmentReg::Ss,
        SegmentReg::Ds,
        SegmentReg::Fs,
        SegmentReg::Gs,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(SegmentReg::Es),
            1 => Some(SegmentReg::Cs),
            2 => Some(SegmentReg::Ss),
            3 => Some(SegmentReg::Ds),
            4 => Some(SegmentReg::Fs),
            5 => Some(SegmentReg::Gs),
            _ => None,
        }
    }
}

/// Raw REX byte (`0x40..=0x4F`).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RexPrefix(pub u8);

impl RexPrefix {
    pub const fn w(self) -> bool {
        self.0 & 0x8 != 0
    }
    pub const fn r(self) -> bool {
        self.0 & 0x4 != 0
    }
    pub const fn x(self) -> bool {
        self.0 & 0x2 != 0
    }
    pub const fn b(self) -> bool {
        self.0 & 0x1 != 0
    }
}

impl fmt::Debug for RexPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rex({:#04x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepPrefix {
    Rep,
    Repne,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: Option<RepPrefix>,
    pub segment: Option<SegmentReg>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub rex: Option<RexPrefix>,
}

impl Prefixes {
    #[inline]
    pub fn rex_w(&self) -> bool {
        self.rex.is_some_and(RexPrefix::w)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeMap {
    /// One-byte opcode map.
    Primary,
    /// `0F xx`.
    Secondary,
    /// `0F 38 xx`.
    Escape38,
    /// `0F 3A xx`.
    Escape3A,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperandSize {
    Bits8,
    Bits16,
    Bits32,
    Bits64,
}

impl OperandSize {
    pub const fn bytes(self) -> u8 {
        match self {
            OperandSize::Bits8 => 1,
            OperandSize::Bits16 => 2,
            OperandSize::Bits32 => 4,
            OperandSize::Bits64 => 8,
        }
    }

    pub const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    pub const fn from_bytes(bytes: u8) -> Option<Self> {
        match bytes {
            1 => Some(OperandSize::Bits8),
            2 => Some(OperandSize::Bits16),
            4 => Some(OperandSize::Bits32),
            8 => Some(OperandSize::Bits64),
            _ => None,
        }
    }

    pub const fn mask(self) -> u64 {
        match self {
            OperandSize::Bits8 => 0xFF,
            OperandSize::Bits16 => 0xFFFF,
            OperandSize::Bits32 => 0xFFFF_FFFF,
            OperandSize::Bits64 => u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSize {
    Bits16,
    Bits32,
    Bits64,
}

impl AddressSize {
    pub const fn mask(self) -> u64 {
        match self {
            AddressSize::Bits16 => 0xFFFF,
            AddressSize::Bits32 => 0xFFFF_FFFF,
            AddressSize::Bits64 => u64::MAX,
        }
    }

    pub const fn bytes(self) -> u8 {
        match self {
            AddressSize::Bits16 => 2,
            AddressSize::Bits32 => 4,
            AddressSize::Bits64 => 8,
        }
    }
}

/// Raw ModRM fields. `reg`/`rm` are *not* REX-extended here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub const fn from_byte(b: u8) -> Self {
        Self {
            md: b >> 6,
            reg: (b >> 3) & 7,
            rm: b & 7,
        }
    }
}

/// A decoded memory operand.
///
/// Registers are numbered 0..=15 in the usual `rAX, rCX, rDX, rBX, rSP, rBP,
/// rSI, rDI, r8..r15` order. `segment` is the effective segment (override or
/// default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: i64,
    pub rip_relative: bool,
    pub segment: SegmentReg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmOperand {
    Reg(u8),
    Mem(MemOperand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

impl AluOp {
    pub const fn from_index(i: u8) -> Self {
        match i & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    /// `CMP` only updates flags.
    pub const fn writes_result(self) -> bool {
        !matches!(self, AluOp::Cmp)
    }
}

/// x86 condition codes, in encoding order (`Jcc` low nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    pub const fn from_nibble(n: u8) -> Self {
        match n & 0xF {
            0 => Cond::O,
            1 => Cond::No,
            2 => Cond::B,
            3 => Cond::Ae,
            4 => Cond::E,
            5 => Cond::Ne,
            6 => Cond::Be,
            7 => Cond::A,
            8 => Cond::S,
            9 => Cond::Ns,
            10 => Cond::P,
            11 => Cond::Np,
            12 => Cond::L,
            13 => Cond::Ge,
            14 => Cond::Le,
            _ => Cond::G,
        }
    }
}

/// Handler identifier assigned by the opcode tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstClass {
    /// Reserved/undefined encoding for the current mode.
    Invalid,
    /// Valid encoding whose semantics are not modelled by this core.
    Unsupported,
    Nop,
    /// `op r/m, reg`
    AluRmReg,
    /// `op reg, r/m`
    AluRegRm,
    /// `op AL/eAX, imm`
    AluAccImm,
    /// Group 1: `op r/m, imm`
    AluRmImm,
    Test,
    Xchg,
    /// `INC/DEC r` (`40..=4F`, not available in 64-bit mode).
    IncDecReg,
    /// Group 4/5 `/0` and `/1`.
    IncDecRm,
    MovRmReg,
    MovRegRm,
    MovRegImm,
    MovRmImm,
    Movzx,
    Movsx,
    Lea,
    MovFromSreg,
    MovToSreg,
    PushReg,
    PopReg,
    PushImm,
    JmpRel,
    Jcc,
    /// `LOOP`, `LOOPE`, `LOOPNE`, `JCXZ`.
    LoopRel,
    CallRel,
    Ret,
    RetImm,
    JmpRm,
    CallRm,
    FarJmp,
    FarCall,
    FarRet,
    Iret,
    Hlt,
    /// `CMC`, `CLC`, `STC`, `CLD`, `STD`.
    FlagOp,
    Cli,
    Sti,
    Popf,
    Int3,
    IntImm,
    Into,
    /// `IN`, `OUT`, `INS`, `OUTS`.
    Io,
    MovCr,
    /// Privileged/system instructions that need the surrounding VMM.
    System,
    Cpuid,
    Ud2,
}

/// How an instruction affects translation-block formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEffect {
    None,
    /// Unconditional control transfer.
    Branch,
    CondBranch,
    /// May change state that is part of the TB lookup key.
    ModeChange,
    /// Leaves the run loop (halt, interrupt, I/O, assist).
    Stop,
}

impl BlockEffect {
    pub const fn ends_block(self) -> bool {
        !matches!(self, BlockEffect::None)
    }
}

impl InstClass {
    pub const fn block_effect(self) -> BlockEffect {
        use InstClass::*;
        match self {
            JmpRel | JmpRm | Ret | RetImm | CallRel | CallRm => BlockEffect::Branch,
            Jcc | LoopRel => BlockEffect::CondBranch,
            FarJmp | FarCall | FarRet | Iret | MovToSreg | MovCr | Popf | System => {
                BlockEffect::ModeChange
            }
            Hlt | Int3 | IntImm | Into | Io | Cpuid | Sti | Ud2 | Invalid => BlockEffect::Stop,
            _ => BlockEffect::None,
        }
    }
}

/// A fully decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInst {
    pub length: u8,
    pub map: OpcodeMap,
    pub opcode: u8,
    pub class: InstClass,
    pub flags: OpFlags,
    pub prefixes: Prefixes,
    pub operand_size: OperandSize,
    pub address_size: AddressSize,
    pub modrm: Option<ModRm>,
    pub rm: Option<RmOperand>,
    /// Immediate, zero-extended from `imm_size` bytes.
    pub imm: u64,
    pub imm_size: u8,
    /// Second immediate (`ENTER` level, far-pointer selector).
    pub imm2: u16,
}

impl DecodedInst {
    /// ModRM.reg extended with REX.R.
    pub fn reg(&self) -> u8 {
        let reg = self.modrm.map_or(0, |m| m.reg);
        reg | if self.prefixes.rex.is_some_and(RexPrefix::r) {
            8
        } else {
            0
        }
    }

    /// Register encoded in the low opcode bits (`+r` forms), extended with REX.B.
    pub fn opcode_reg(&self) -> u8 {
        (self.opcode & 7)
            | if self.prefixes.rex.is_some_and(RexPrefix::b) {
                8
            } else {
                0
            }
    }

    /// Immediate sign-extended from its encoded width.
    pub fn imm_sext(&self) -> i64 {
        match self.imm_size {
            1 => self.imm as u8 as i8 as i64,
            2 => self.imm as u16 as i16 as i64,
            4 => self.imm as u32 as i32 as i64,
            _ => self.imm as i64,
        }
    }

    pub fn alu_op(&self) -> AluOp {
        match self.class {
            InstClass::AluRmImm => AluOp::from_index(self.modrm.map_or(0, |m| m.reg)),
            _ => AluOp::from_index(self.opcode >> 3),
        }
    }

    pub fn cond(&self) -> Cond {
        Cond::from_nibble(self.opcode)
    }

    pub fn is_byte_op(&self) -> bool {
        self.operand_size == OperandSize::Bits8
    }

    pub fn block_effect(&self) -> BlockEffect {
        self.class.block_effect()
    }

    /// `LOCK` is only architecturally valid on read-modify-write forms with a
    /// memory destination.
    pub fn lock_is_valid(&self) -> bool {
        self.flags.contains(OpFlags::LOCKABLE) && matches!(self.rm, Some(RmOperand::Mem(_)))
    }
}

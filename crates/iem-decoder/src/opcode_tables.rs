//! Statically initialised opcode maps.
//!
//! Each map is a plain `[OpcodeEntry; 256]` built at compile time. Group
//! opcodes (`80..=83`, `C6`, `C7`, `F6`, `F7`, `FE`, `FF`) carry
//! [`OpFlags::GROUP`]; their final class depends on ModRM.reg and is resolved
//! by [`resolve_group`].

use bitflags::bitflags;

use crate::inst::InstClass;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpFlags: u16 {
        /// A ModRM byte follows the opcode.
        const MODRM = 1 << 0;
        /// 8-bit operand size regardless of prefixes.
        const BYTE_OP = 1 << 1;
        /// Operand size defaults to 64 bits in long mode (stack ops, near branches).
        const DEFAULT_64 = 1 << 2;
        /// Accepts a `LOCK` prefix with a memory destination.
        const LOCKABLE = 1 << 3;
        /// Undefined in 64-bit mode.
        const INVALID_64 = 1 << 4;
        /// Class depends on ModRM.reg.
        const GROUP = 1 << 5;
    }
}

/// Immediate operand encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmSize {
    None,
    /// 8-bit immediate.
    Ib,
    /// 16-bit immediate.
    Iw,
    /// 16 or 32 bits depending on operand size (32 for 64-bit operand size).
    Iz,
    /// 16, 32 or 64 bits depending on operand size (`MOV r, imm`).
    Iv,
    /// `ENTER`: 16-bit immediate followed by an 8-bit immediate.
    IwIb,
    /// Far pointer: 16/32-bit offset followed by a 16-bit selector.
    Ap,
    /// 8-bit relative displacement.
    Jb,
    /// 16/32-bit relative displacement.
    Jz,
    /// Absolute memory offset sized by the address size.
    MOffs,
    /// Group 3 (`F6`/`F7`): `TEST` forms (`/0`, `/1`) carry an immediate.
    Group3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeEntry {
    pub class: InstClass,
    pub imm: ImmSize,
    pub flags: OpFlags,
}

impl OpcodeEntry {
    const fn new(class: InstClass, imm: ImmSize, flags: OpFlags) -> Self {
        Self { class, imm, flags }
    }
}

const NONE: OpFlags = OpFlags::empty();
const M: OpFlags = OpFlags::MODRM;
const MB: OpFlags = OpFlags::MODRM.union(OpFlags::BYTE_OP);
const MBL: OpFlags = MB.union(OpFlags::LOCKABLE);
const ML: OpFlags = OpFlags::MODRM.union(OpFlags::LOCKABLE);
const B: OpFlags = OpFlags::BYTE_OP;
const D64: OpFlags = OpFlags::DEFAULT_64;
const I64: OpFlags = OpFlags::INVALID_64;
const MG: OpFlags = OpFlags::MODRM.union(OpFlags::GROUP);

const INVALID: OpcodeEntry = OpcodeEntry::new(InstClass::Invalid, ImmSize::None, NONE);

/// One-byte opcode map.
pub static PRIMARY: [OpcodeEntry; 256] = build_primary();

/// Two-byte (`0F xx`) opcode map.
pub static SECONDARY: [OpcodeEntry; 256] = build_secondary();

/// `0F 38 xx`: every opcode takes ModRM, none take an immediate.
pub const ESCAPE_38: OpcodeEntry = OpcodeEntry::new(InstClass::Unsupported, ImmSize::None, M);

/// `0F 3A xx`: every opcode takes ModRM and an 8-bit immediate.
pub const ESCAPE_3A: OpcodeEntry = OpcodeEntry::new(InstClass::Unsupported, ImmSize::Ib, M);

const fn build_primary() -> [OpcodeEntry; 256] {
    use InstClass::*;
    use ImmSize as I;

    let mut t = [INVALID; 256];

    // 00..=3F: the eight classic ALU ops, six encodings each.
    let mut op = 0usize;
    while op < 8 {
        let base = op * 8;
        t[base] = OpcodeEntry::new(AluRmReg, I::None, MBL);
        t[base + 1] = OpcodeEntry::new(AluRmReg, I::None, ML);
        t[base + 2] = OpcodeEntry::new(AluRegRm, I::None, MB);
        t[base + 3] = OpcodeEntry::new(AluRegRm, I::None, M);
        t[base + 4] = OpcodeEntry::new(AluAccImm, I::Ib, B);
        t[base + 5] = OpcodeEntry::new(AluAccImm, I::Iz, NONE);
        op += 1;
    }
    // CMP never writes its destination.
    t[0x38] = OpcodeEntry::new(AluRmReg, I::None, MB);
    t[0x39] = OpcodeEntry::new(AluRmReg, I::None, M);

    // PUSH/POP of ES, CS, SS, DS and the BCD adjust instructions.
    let legacy_seg_and_bcd = [0x06, 0x07, 0x0E, 0x16, 0x17, 0x1E, 0x1F, 0x27, 0x2F, 0x37, 0x3F];
    let mut i = 0;
    while i < legacy_seg_and_bcd.len() {
        t[legacy_seg_and_bcd[i]] = OpcodeEntry::new(Unsupported, I::None, I64);
        i += 1;
    }
    // POP SS reloads a segment register that participates in flat-mode detection.
    t[0x17] = OpcodeEntry::new(MovToSreg, I::None, I64);
    t[0x1F] = OpcodeEntry::new(MovToSreg, I::None, I64);
    t[0x07] = OpcodeEntry::new(MovToSreg, I::None, I64);

    let mut r = 0usize;
    while r < 8 {
        t[0x40 + r] = OpcodeEntry::new(IncDecReg, I::None, I64);
        t[0x48 + r] = OpcodeEntry::new(IncDecReg, I::None, I64);
        t[0x50 + r] = OpcodeEntry::new(PushReg, I::None, D64);
        t[0x58 + r] = OpcodeEntry::new(PopReg, I::None, D64);
        t[0xB0 + r] = OpcodeEntry::new(MovRegImm, I::Ib, B);
        t[0xB8 + r] = OpcodeEntry::new(MovRegImm, I::Iv, NONE);
        r += 1;
    }

    t[0x60] = OpcodeEntry::new(Unsupported, I::None, I64);
    t[0x61] = OpcodeEntry::new(Unsupported, I::None, I64);
    t[0x62] = OpcodeEntry::new(Unsupported, I::None, M.union(I64));
    t[0x63] = OpcodeEntry::new(Unsupported, I::None, M);
    t[0x68] = OpcodeEntry::new(PushImm, I::Iz, D64);
    t[0x69] = OpcodeEntry::new(Unsupported, I::Iz, M);
    t[0x6A] = OpcodeEntry::new(PushImm, I::Ib, D64);
    t[0x6B] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0x6C] = OpcodeEntry::new(Io, I::None, B);
    t[0x6D] = OpcodeEntry::new(Io, I::None, NONE);
    t[0x6E] = OpcodeEntry::new(Io, I::None, B);
    t[0x6F] = OpcodeEntry::new(Io, I::None, NONE);

    let mut cc = 0usize;
    while cc < 16 {
        t[0x70 + cc] = OpcodeEntry::new(Jcc, I::Jb, D64);
        cc += 1;
    }

    t[0x80] = OpcodeEntry::new(AluRmImm, I::Ib, MG.union(B).union(OpFlags::LOCKABLE));
    t[0x81] = OpcodeEntry::new(AluRmImm, I::Iz, MG.union(OpFlags::LOCKABLE));
    t[0x82] = OpcodeEntry::new(AluRmImm, I::Ib, MG.union(B).union(I64).union(OpFlags::LOCKABLE));
    t[0x83] = OpcodeEntry::new(AluRmImm, I::Ib, MG.union(OpFlags::LOCKABLE));
    t[0x84] = OpcodeEntry::new(Test, I::None, MB);
    t[0x85] = OpcodeEntry::new(Test, I::None, M);
    t[0x86] = OpcodeEntry::new(Xchg, I::None, MBL);
    t[0x87] = OpcodeEntry::new(Xchg, I::None, ML);
    t[0x88] = OpcodeEntry::new(MovRmReg, I::None, MB);
    t[0x89] = OpcodeEntry::new(MovRmReg, I::None, M);
    t[0x8A] = OpcodeEntry::new(MovRegRm, I::None, MB);
    t[0x8B] = OpcodeEntry::new(MovRegRm, I::None, M);
    t[0x8C] = OpcodeEntry::new(MovFromSreg, I::None, M);
    t[0x8D] = OpcodeEntry::new(Lea, I::None, M);
    t[0x8E] = OpcodeEntry::new(MovToSreg, I::None, M);
    t[0x8F] = OpcodeEntry::new(Unsupported, I::None, M.union(D64));

    t[0x90] = OpcodeEntry::new(Nop, I::None, NONE);
    let mut x = 0x91usize;
    while x <= 0x99 {
        t[x] = OpcodeEntry::new(Unsupported, I::None, NONE);
        x += 1;
    }
    t[0x9A] = OpcodeEntry::new(FarCall, I::Ap, I64);
    t[0x9B] = OpcodeEntry::new(Unsupported, I::None, NONE);
    t[0x9C] = OpcodeEntry::new(Unsupported, I::None, D64);
    t[0x9D] = OpcodeEntry::new(Popf, I::None, D64);
    t[0x9E] = OpcodeEntry::new(Unsupported, I::None, NONE);
    t[0x9F] = OpcodeEntry::new(Unsupported, I::None, NONE);

    t[0xA0] = OpcodeEntry::new(Unsupported, I::MOffs, B);
    t[0xA1] = OpcodeEntry::new(Unsupported, I::MOffs, NONE);
    t[0xA2] = OpcodeEntry::new(Unsupported, I::MOffs, B);
    t[0xA3] = OpcodeEntry::new(Unsupported, I::MOffs, NONE);
    let mut s = 0xA4usize;
    while s <= 0xAF {
        t[s] = OpcodeEntry::new(Unsupported, I::None, NONE);
        s += 1;
    }
    t[0xA8] = OpcodeEntry::new(Unsupported, I::Ib, B);
    t[0xA9] = OpcodeEntry::new(Unsupported, I::Iz, NONE);

    t[0xC0] = OpcodeEntry::new(Unsupported, I::Ib, MB);
    t[0xC1] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0xC2] = OpcodeEntry::new(RetImm, I::Iw, D64);
    t[0xC3] = OpcodeEntry::new(Ret, I::None, D64);
    t[0xC4] = OpcodeEntry::new(Unsupported, I::None, M.union(I64));
    t[0xC5] = OpcodeEntry::new(Unsupported, I::None, M.union(I64));
    t[0xC6] = OpcodeEntry::new(MovRmImm, I::Ib, MG.union(B));
    t[0xC7] = OpcodeEntry::new(MovRmImm, I::Iz, MG);
    t[0xC8] = OpcodeEntry::new(Unsupported, I::IwIb, D64);
    t[0xC9] = OpcodeEntry::new(Unsupported, I::None, D64);
    t[0xCA] = OpcodeEntry::new(FarRet, I::Iw, NONE);
    t[0xCB] = OpcodeEntry::new(FarRet, I::None, NONE);
    t[0xCC] = OpcodeEntry::new(Int3, I::None, NONE);
    t[0xCD] = OpcodeEntry::new(IntImm, I::Ib, NONE);
    t[0xCE] = OpcodeEntry::new(Into, I::None, I64);
    t[0xCF] = OpcodeEntry::new(Iret, I::None, NONE);

    t[0xD0] = OpcodeEntry::new(Unsupported, I::None, MB);
    t[0xD1] = OpcodeEntry::new(Unsupported, I::None, M);
    t[0xD2] = OpcodeEntry::new(Unsupported, I::None, MB);
    t[0xD3] = OpcodeEntry::new(Unsupported, I::None, M);
    t[0xD4] = OpcodeEntry::new(Unsupported, I::Ib, I64);
    t[0xD5] = OpcodeEntry::new(Unsupported, I::Ib, I64);
    t[0xD7] = OpcodeEntry::new(Unsupported, I::None, NONE);
    let mut fpu = 0xD8usize;
    while fpu <= 0xDF {
        t[fpu] = OpcodeEntry::new(Unsupported, I::None, M);
        fpu += 1;
    }

    t[0xE0] = OpcodeEntry::new(LoopRel, I::Jb, D64);
    t[0xE1] = OpcodeEntry::new(LoopRel, I::Jb, D64);
    t[0xE2] = OpcodeEntry::new(LoopRel, I::Jb, D64);
    t[0xE3] = OpcodeEntry::new(LoopRel, I::Jb, D64);
    t[0xE4] = OpcodeEntry::new(Io, I::Ib, B);
    t[0xE5] = OpcodeEntry::new(Io, I::Ib, NONE);
    t[0xE6] = OpcodeEntry::new(Io, I::Ib, B);
    t[0xE7] = OpcodeEntry::new(Io, I::Ib, NONE);
    t[0xE8] = OpcodeEntry::new(CallRel, I::Jz, D64);
    t[0xE9] = OpcodeEntry::new(JmpRel, I::Jz, D64);
    t[0xEA] = OpcodeEntry::new(FarJmp, I::Ap, I64);
    t[0xEB] = OpcodeEntry::new(JmpRel, I::Jb, D64);
    t[0xEC] = OpcodeEntry::new(Io, I::None, B);
    t[0xED] = OpcodeEntry::new(Io, I::None, NONE);
    t[0xEE] = OpcodeEntry::new(Io, I::None, B);
    t[0xEF] = OpcodeEntry::new(Io, I::None, NONE);

    t[0xF1] = OpcodeEntry::new(Unsupported, I::None, NONE);
    t[0xF4] = OpcodeEntry::new(Hlt, I::None, NONE);
    t[0xF5] = OpcodeEntry::new(FlagOp, I::None, NONE);
    t[0xF6] = OpcodeEntry::new(Unsupported, I::Group3, MG.union(B));
    t[0xF7] = OpcodeEntry::new(Unsupported, I::Group3, MG);
    t[0xF8] = OpcodeEntry::new(FlagOp, I::None, NONE);
    t[0xF9] = OpcodeEntry::new(FlagOp, I::None, NONE);
    t[0xFA] = OpcodeEntry::new(Cli, I::None, NONE);
    t[0xFB] = OpcodeEntry::new(Sti, I::None, NONE);
    t[0xFC] = OpcodeEntry::new(FlagOp, I::None, NONE);
    t[0xFD] = OpcodeEntry::new(FlagOp, I::None, NONE);
    t[0xFE] = OpcodeEntry::new(IncDecRm, I::None, MG.union(B).union(OpFlags::LOCKABLE));
    t[0xFF] = OpcodeEntry::new(IncDecRm, I::None, MG.union(OpFlags::LOCKABLE));

    t
}

const fn build_secondary() -> [OpcodeEntry; 256] {
    use InstClass::*;
    use ImmSize as I;

    // Most of the two-byte map (SSE, CMOVcc, SETcc, bit ops) takes a ModRM byte.
    let mut t = [OpcodeEntry::new(Unsupported, I::None, M); 256];

    t[0x00] = OpcodeEntry::new(System, I::None, M);
    t[0x01] = OpcodeEntry::new(System, I::None, M);
    t[0x05] = OpcodeEntry::new(System, I::None, NONE);
    t[0x06] = OpcodeEntry::new(System, I::None, NONE);
    t[0x07] = OpcodeEntry::new(System, I::None, NONE);
    t[0x08] = OpcodeEntry::new(System, I::None, NONE);
    t[0x09] = OpcodeEntry::new(System, I::None, NONE);
    t[0x0B] = OpcodeEntry::new(Ud2, I::None, NONE);
    t[0x0D] = OpcodeEntry::new(Nop, I::None, M);

    let invalid = [0x04, 0x0A, 0x0C, 0x0E, 0x0F, 0x24, 0x25, 0x26, 0x27, 0x36, 0x39, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F];
    let mut i = 0;
    while i < invalid.len() {
        t[invalid[i]] = INVALID;
        i += 1;
    }

    let mut hint = 0x18usize;
    while hint <= 0x1F {
        t[hint] = OpcodeEntry::new(Nop, I::None, M);
        hint += 1;
    }

    t[0x20] = OpcodeEntry::new(MovCr, I::None, M);
    t[0x21] = OpcodeEntry::new(System, I::None, M);
    t[0x22] = OpcodeEntry::new(MovCr, I::None, M);
    t[0x23] = OpcodeEntry::new(System, I::None, M);

    t[0x30] = OpcodeEntry::new(System, I::None, NONE);
    t[0x31] = OpcodeEntry::new(System, I::None, NONE);
    t[0x32] = OpcodeEntry::new(System, I::None, NONE);
    t[0x33] = OpcodeEntry::new(System, I::None, NONE);
    t[0x34] = OpcodeEntry::new(System, I::None, NONE);
    t[0x35] = OpcodeEntry::new(System, I::None, NONE);
    t[0x37] = OpcodeEntry::new(System, I::None, NONE);

    t[0x70] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0x71] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0x72] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0x73] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0x77] = OpcodeEntry::new(Unsupported, I::None, NONE);

    let mut cc = 0usize;
    while cc < 16 {
        t[0x80 + cc] = OpcodeEntry::new(Jcc, I::Jz, D64);
        cc += 1;
    }

    t[0xA0] = OpcodeEntry::new(Unsupported, I::None, D64);
    t[0xA1] = OpcodeEntry::new(Unsupported, I::None, D64);
    t[0xA2] = OpcodeEntry::new(Cpuid, I::None, NONE);
    t[0xA4] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0xA8] = OpcodeEntry::new(Unsupported, I::None, D64);
    t[0xA9] = OpcodeEntry::new(Unsupported, I::None, D64);
    t[0xAA] = OpcodeEntry::new(System, I::None, NONE);
    t[0xAC] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0xB0] = OpcodeEntry::new(Unsupported, I::None, MBL);
    t[0xB1] = OpcodeEntry::new(Unsupported, I::None, ML);
    t[0xB6] = OpcodeEntry::new(Movzx, I::None, M);
    t[0xB7] = OpcodeEntry::new(Movzx, I::None, M);
    t[0xBA] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0xBE] = OpcodeEntry::new(Movsx, I::None, M);
    t[0xBF] = OpcodeEntry::new(Movsx, I::None, M);
    t[0xC0] = OpcodeEntry::new(Unsupported, I::None, MBL);
    t[0xC1] = OpcodeEntry::new(Unsupported, I::None, ML);
    t[0xC2] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0xC4] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0xC5] = OpcodeEntry::new(Unsupported, I::Ib, M);
    t[0xC6] = OpcodeEntry::new(Unsupported, I::Ib, M);

    let mut r = 0usize;
    while r < 8 {
        t[0xC8 + r] = OpcodeEntry::new(Unsupported, I::None, NONE);
        r += 1;
    }

    t[0xFF] = OpcodeEntry::new(Ud2, I::None, M);

    t
}

/// Resolve the class of a group opcode from ModRM.reg.
///
/// Returns `(class, extra_flags)`; `extra_flags` is OR-ed into the table flags
/// (e.g. `CALL r/m` and `JMP r/m` default to 64-bit operands in long mode).
pub const fn resolve_group(entry: &OpcodeEntry, opcode: u8, reg: u8) -> (InstClass, OpFlags) {
    use InstClass::*;
    match opcode {
        0x80..=0x83 => (AluRmImm, NONE),
        0xC6 | 0xC7 => match reg {
            0 => (MovRmImm, NONE),
            _ => (Invalid, NONE),
        },
        0xF6 | 0xF7 => match reg {
            0 | 1 => (Test, NONE),
            _ => (Unsupported, NONE),
        },
        0xFE => match reg {
            0 | 1 => (IncDecRm, NONE),
            _ => (Invalid, NONE),
        },
        0xFF => match reg {
            0 | 1 => (IncDecRm, NONE),
            2 => (CallRm, D64),
            3 => (FarCall, NONE),
            4 => (JmpRm, D64),
            5 => (FarJmp, NONE),
            6 => (Unsupported, D64),
            _ => (Invalid, NONE),
        },
        _ => (entry.class, NONE),
    }
}

use crate::inst::{
    AddressSize, DecodeMode, DecodedInst, InstClass, MemOperand, ModRm, OpcodeMap, OperandSize,
    Prefixes, RepPrefix, RexPrefix, RmOperand, SegmentReg,
};
use crate::opcode_tables::{self, ImmSize, OpFlags, OpcodeEntry};
use crate::{DecodeError, MAX_INST_LEN};

/// Decode a single instruction from the start of `bytes`.
///
/// At most [`MAX_INST_LEN`] bytes are consumed. An encoding that would need
/// more fails with [`DecodeError::TooLong`]; a slice that ends early fails with
/// [`DecodeError::UnexpectedEof`].
pub fn decode(bytes: &[u8], mode: DecodeMode) -> Result<DecodedInst, DecodeError> {
    let mut cur = Cursor { bytes, pos: 0 };
    let prefixes = scan_prefixes(&mut cur, mode)?;

    let (map, opcode, entry) = parse_opcode(&mut cur)?;
    let mut class = entry.class;
    let mut flags = entry.flags;

    if class == InstClass::Invalid {
        return Err(DecodeError::Invalid);
    }
    if mode == DecodeMode::Bits64 && flags.contains(OpFlags::INVALID_64) {
        return Err(DecodeError::Invalid);
    }

    let modrm = if flags.contains(OpFlags::MODRM) {
        Some(ModRm::from_byte(cur.next_u8()?))
    } else {
        None
    };

    // VEX/EVEX/XOP share their first byte with legacy opcodes; none of them
    // are modelled.
    if let Some(m) = modrm {
        if map == OpcodeMap::Primary {
            match opcode {
                0x62 | 0xC4 | 0xC5 if m.md == 3 => return Err(DecodeError::Invalid),
                0x8F if m.reg != 0 => return Err(DecodeError::Invalid),
                _ => {}
            }
        }
    }

    if flags.contains(OpFlags::GROUP) {
        let reg = modrm.map_or(0, |m| m.reg);
        let (resolved, extra) = opcode_tables::resolve_group(&entry, opcode, reg);
        if resolved == InstClass::Invalid {
            return Err(DecodeError::Invalid);
        }
        class = resolved;
        flags |= extra;
    }

    // XCHG r8, rAX shares 0x90 with NOP.
    if map == OpcodeMap::Primary
        && opcode == 0x90
        && prefixes.rex.is_some_and(RexPrefix::b)
    {
        class = InstClass::Unsupported;
    }

    let mut operand_size = effective_operand_size(mode, prefixes, class, flags);
    if map == OpcodeMap::Primary && matches!(opcode, 0x8C | 0x8E) {
        operand_size = OperandSize::Bits16;
    }
    let address_size = effective_address_size(mode, prefixes);

    let rm = match modrm {
        Some(m) => Some(decode_rm(&mut cur, mode, prefixes, address_size, map, opcode, m)?),
        None => None,
    };

    validate_operands(map, opcode, class, modrm, rm)?;

    let imm_kind = match entry.imm {
        ImmSize::Group3 => match modrm.map_or(0, |m| m.reg) {
            0 | 1 if flags.contains(OpFlags::BYTE_OP) => ImmSize::Ib,
            0 | 1 => ImmSize::Iz,
            _ => ImmSize::None,
        },
        other => other,
    };
    let (imm, imm_size, imm2) = read_immediates(&mut cur, mode, imm_kind, operand_size, address_size)?;

    Ok(DecodedInst {
        length: cur.pos as u8,
        map,
        opcode,
        class,
        flags,
        prefixes,
        operand_size,
        address_size,
        modrm,
        rm,
        imm,
        imm_size,
        imm2,
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, DecodeError> {
        if self.pos >= MAX_INST_LEN {
            return Err(DecodeError::TooLong);
        }
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(DecodeError::UnexpectedEof)
    }

    fn next_u8(&mut self) -> Result<u8, DecodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn read_le(&mut self, n: u8) -> Result<u64, DecodeError> {
        let mut v = 0u64;
        for i in 0..n {
            v |= (self.next_u8()? as u64) << (8 * i as u32);
        }
        Ok(v)
    }
}

fn segment_override(b: u8) -> Option<SegmentReg> {
    match b {
        0x26 => Some(SegmentReg::Es),
        0x2E => Some(SegmentReg::Cs),
        0x36 => Some(SegmentReg::Ss),
        0x3E => Some(SegmentReg::Ds),
        0x64 => Some(SegmentReg::Fs),
        0x65 => Some(SegmentReg::Gs),
        _ => None,
    }
}

fn scan_prefixes(cur: &mut Cursor<'_>, mode: DecodeMode) -> Result<Prefixes, DecodeError> {
    let mut prefixes = Prefixes::default();

    loop {
        let b = cur.peek()?;

        // A REX prefix only takes effect when it immediately precedes the
        // opcode; a legacy prefix after it cancels it.
        if mode == DecodeMode::Bits64 && (0x40..=0x4F).contains(&b) {
            prefixes.rex = Some(RexPrefix(b));
            cur.pos += 1;
            continue;
        }

        if let Some(seg) = segment_override(b) {
            // CS/DS/ES/SS overrides are no-ops in long mode and must not clear FS/GS.
            match (mode, seg) {
                (DecodeMode::Bits64, SegmentReg::Fs | SegmentReg::Gs) => {
                    prefixes.segment = Some(seg)
                }
                (DecodeMode::Bits64, _) => {}
                _ => prefixes.segment = Some(seg),
            }
            prefixes.rex = None;
            cur.pos += 1;
            continue;
        }

        match b {
            0xF0 => prefixes.lock = true,
            0xF2 => prefixes.rep = Some(RepPrefix::Repne),
            0xF3 => prefixes.rep = Some(RepPrefix::Rep),
            0x66 => prefixes.operand_size_override = true,
            0x67 => prefixes.address_size_override = true,
            _ => break,
        }
        prefixes.rex = None;
        cur.pos += 1;
    }

    Ok(prefixes)
}

fn parse_opcode(cur: &mut Cursor<'_>) -> Result<(OpcodeMap, u8, OpcodeEntry), DecodeError> {
    let b0 = cur.next_u8()?;
    if b0 != 0x0F {
        return Ok((OpcodeMap::Primary, b0, opcode_tables::PRIMARY[b0 as usize]));
    }
    let b1 = cur.next_u8()?;
    match b1 {
        0x38 => {
            let b2 = cur.next_u8()?;
            Ok((OpcodeMap::Escape38, b2, opcode_tables::ESCAPE_38))
        }
        0x3A => {
            let b2 = cur.next_u8()?;
            Ok((OpcodeMap::Escape3A, b2, opcode_tables::ESCAPE_3A))
        }
        _ => Ok((OpcodeMap::Secondary, b1, opcode_tables::SECONDARY[b1 as usize])),
    }
}

fn effective_operand_size(
    mode: DecodeMode,
    prefixes: Prefixes,
    class: InstClass,
    flags: OpFlags,
) -> OperandSize {
    if flags.contains(OpFlags::BYTE_OP) {
        return OperandSize::Bits8;
    }
    match mode {
        DecodeMode::Bits16 => {
            if prefixes.operand_size_override {
                OperandSize::Bits32
            } else {
                OperandSize::Bits16
            }
        }
        DecodeMode::Bits32 => {
            if prefixes.operand_size_override {
                OperandSize::Bits16
            } else {
                OperandSize::Bits32
            }
        }
        DecodeMode::Bits64 => {
            // Near branches ignore 0x66 in long mode (Intel behaviour).
            let near_branch = matches!(
                class,
                InstClass::JmpRel
                    | InstClass::Jcc
                    | InstClass::LoopRel
                    | InstClass::CallRel
                    | InstClass::Ret
                    | InstClass::RetImm
                    | InstClass::JmpRm
                    | InstClass::CallRm
            );
            if prefixes.rex_w() || near_branch {
                OperandSize::Bits64
            } else if prefixes.operand_size_override {
                OperandSize::Bits16
            } else if flags.contains(OpFlags::DEFAULT_64) {
                OperandSize::Bits64
            } else {
                OperandSize::Bits32
            }
        }
    }
}

fn effective_address_size(mode: DecodeMode, prefixes: Prefixes) -> AddressSize {
    match (mode, prefixes.address_size_override) {
        (DecodeMode::Bits16, false) | (DecodeMode::Bits32, true) => AddressSize::Bits16,
        (DecodeMode::Bits16, true) | (DecodeMode::Bits32, false) | (DecodeMode::Bits64, true) => {
            AddressSize::Bits32
        }
        (DecodeMode::Bits64, false) => AddressSize::Bits64,
    }
}

fn decode_rm(
    cur: &mut Cursor<'_>,
    mode: DecodeMode,
    prefixes: Prefixes,
    address_size: AddressSize,
    map: OpcodeMap,
    opcode: u8,
    m: ModRm,
) -> Result<RmOperand, DecodeError> {
    let rex_b = if prefixes.rex.is_some_and(RexPrefix::b) { 8 } else { 0 };

    // MOV to/from control and debug registers ignore ModRM.mod.
    if m.md == 3 || (map == OpcodeMap::Secondary && (0x20..=0x23).contains(&opcode)) {
        return Ok(RmOperand::Reg(m.rm | rex_b));
    }

    let mem = match address_size {
        AddressSize::Bits16 => decode_mem16(cur, prefixes, m)?,
        AddressSize::Bits32 | AddressSize::Bits64 => decode_mem32(cur, mode, prefixes, m)?,
    };
    Ok(RmOperand::Mem(mem))
}

fn decode_mem16(cur: &mut Cursor<'_>, prefixes: Prefixes, m: ModRm) -> Result<MemOperand, DecodeError> {
    const BX: u8 = 3;
    const BP: u8 = 5;
    const SI: u8 = 6;
    const DI: u8 = 7;

    if m.md == 0 && m.rm == 6 {
        let disp = cur.read_le(2)? as u16 as i16 as i64;
        return Ok(MemOperand {
            base: None,
            index: None,
            scale: 1,
            disp,
            rip_relative: false,
            segment: prefixes.segment.unwrap_or(SegmentReg::Ds),
        });
    }

    let (base, index) = match m.rm {
        0 => (Some(BX), Some(SI)),
        1 => (Some(BX), Some(DI)),
        2 => (Some(BP), Some(SI)),
        3 => (Some(BP), Some(DI)),
        4 => (Some(SI), None),
        5 => (Some(DI), None),
        6 => (Some(BP), None),
        _ => (Some(BX), None),
    };
    let disp = match m.md {
        1 => cur.read_le(1)? as u8 as i8 as i64,
        2 => cur.read_le(2)? as u16 as i16 as i64,
        _ => 0,
    };
    let default_seg = if base == Some(BP) {
        SegmentReg::Ss
    } else {
        SegmentReg::Ds
    };
    Ok(MemOperand {
        base,
        index,
        scale: 1,
        disp,
        rip_relative: false,
        segment: prefixes.segment.unwrap_or(default_seg),
    })
}

fn decode_mem32(
    cur: &mut Cursor<'_>,
    mode: DecodeMode,
    prefixes: Prefixes,
    m: ModRm,
) -> Result<MemOperand, DecodeError> {
    let rex = prefixes.rex.unwrap_or_default();
    let rex_b = if rex.b() { 8 } else { 0 };
    let rex_x = if rex.x() { 8 } else { 0 };

    let base;
    let mut index = None;
    let mut scale = 1;
    let mut rip_relative = false;
    let mut force_disp32 = false;

    if m.rm == 4 {
        let sib = cur.next_u8()?;
        scale = 1u8 << (sib >> 6);
        let idx = ((sib >> 3) & 7) | rex_x;
        if idx != 4 {
            index = Some(idx);
        }
        let b = sib & 7;
        if b == 5 && m.md == 0 {
            base = None;
            force_disp32 = true;
        } else {
            base = Some(b | rex_b);
        }
    } else if m.rm == 5 && m.md == 0 {
        base = None;
        force_disp32 = true;
        rip_relative = mode == DecodeMode::Bits64;
    } else {
        base = Some(m.rm | rex_b);
    }

    let disp = match m.md {
        1 => cur.read_le(1)? as u8 as i8 as i64,
        2 => cur.read_le(4)? as u32 as i32 as i64,
        _ if force_disp32 => cur.read_le(4)? as u32 as i32 as i64,
        _ => 0,
    };

    let default_seg = match base {
        Some(4 | 5) => SegmentReg::Ss,
        _ => SegmentReg::Ds,
    };
    Ok(MemOperand {
        base,
        index,
        scale,
        disp,
        rip_relative,
        segment: prefixes.segment.unwrap_or(default_seg),
    })
}

/// Operand combinations that are undefined even though the opcode is valid.
fn validate_operands(
    map: OpcodeMap,
    opcode: u8,
    class: InstClass,
    modrm: Option<ModRm>,
    rm: Option<RmOperand>,
) -> Result<(), DecodeError> {
    let is_reg = matches!(rm, Some(RmOperand::Reg(_)));
    let reg = modrm.map_or(0, |m| m.reg);
    match class {
        InstClass::Lea if is_reg => Err(DecodeError::Invalid),
        // FF /3 and FF /5 need a memory far pointer.
        InstClass::FarJmp | InstClass::FarCall
            if map == OpcodeMap::Primary && opcode == 0xFF && is_reg =>
        {
            Err(DecodeError::Invalid)
        }
        InstClass::MovFromSreg if reg > 5 => Err(DecodeError::Invalid),
        // MOV CS, r/m is undefined.
        InstClass::MovToSreg if map == OpcodeMap::Primary && opcode == 0x8E && (reg == 1 || reg > 5) => {
            Err(DecodeError::Invalid)
        }
        _ => Ok(()),
    }
}

fn read_immediates(
    cur: &mut Cursor<'_>,
    mode: DecodeMode,
    kind: ImmSize,
    operand_size: OperandSize,
    address_size: AddressSize,
) -> Result<(u64, u8, u16), DecodeError> {
    let z = match operand_size {
        OperandSize::Bits16 => 2,
        _ => 4,
    };
    let (size, second) = match kind {
        ImmSize::None => (0, 0),
        ImmSize::Ib | ImmSize::Jb => (1, 0),
        ImmSize::Iw => (2, 0),
        ImmSize::Iz => (z, 0),
        ImmSize::Jz if mode == DecodeMode::Bits64 => (4, 0),
        ImmSize::Jz => (z, 0),
        ImmSize::Iv => (operand_size.bytes(), 0),
        ImmSize::IwIb => (2, 1),
        ImmSize::Ap => (z, 2),
        ImmSize::MOffs => (address_size.bytes(), 0),
        // Resolved by the caller.
        ImmSize::Group3 => (0, 0),
    };
    let imm = cur.read_le(size)?;
    let imm2 = cur.read_le(second)? as u16;
    Ok((imm, size, imm2))
}

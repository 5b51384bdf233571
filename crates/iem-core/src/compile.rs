//! Threaded-call emitter: turns a run of guest instructions into a
//! [`TranslationBlock`].

use iem_decoder::{
    decode, DecodeError, DecodeMode, DecodedInst, InstClass, OperandSize, Prefixes, RmOperand,
    SegmentReg, MAX_INST_LEN,
};
use tracing::{debug, trace};

use crate::config::IemConfig;
use crate::exception::Exception;
use crate::fetch::InstrStream;
use crate::mem::{GuestMemory, PAGE_MASK, PAGE_SIZE};
use crate::mode::ExecModeFlags;
use crate::state::{gpr_ref, CpuState};
use crate::tb::{ArchIdentity, PhysRange, TbFlags, TranslationBlock};
use crate::threaded::{
    pack_bytes, pack_i64, pack_reg_with, CallEntry, EaDesc, RegDesc, ThreadedFunction,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// Translating or reading the first instruction of the block faulted.
    #[error("fault while compiling block at {pc:#x}: {exception}")]
    Fault { pc: u64, exception: Exception },
}

/// Calls and ranges of a block under construction. Dropped as a whole when
/// compilation fails.
struct TbBuilder {
    calls: Vec<CallEntry>,
    ranges: Vec<PhysRange>,
    cb_pc: usize,
    instructions: u16,
}

impl TbBuilder {
    fn push(&mut self, function: ThreadedFunction, inst_len: u8, params: [u64; 3]) {
        self.calls.push(CallEntry {
            function,
            cb_opcode: inst_len,
            off_opcode: self.cb_pc as u16,
            idx_range: 0,
            params,
        });
    }
}

/// Linear address of `CS:ip` in the block's mode.
fn linear(cpu: &CpuState, mode: DecodeMode, ip: u64) -> u64 {
    match mode {
        DecodeMode::Bits64 => ip,
        _ => cpu.seg(SegmentReg::Cs).base.wrapping_add(ip) & 0xFFFF_FFFF,
    }
}

fn ip_limit(mode: DecodeMode) -> u64 {
    match mode {
        DecodeMode::Bits16 => 0xFFFF,
        DecodeMode::Bits32 => 0xFFFF_FFFF,
        DecodeMode::Bits64 => u64::MAX,
    }
}

/// Compile the block starting at the CPU's current CS:RIP.
///
/// Only a fault on the first instruction is an error; anything that goes
/// wrong later simply ends the block before the offending instruction.
pub fn compile_block(
    cpu: &CpuState,
    mem: &mut dyn GuestMemory,
    stream: &mut InstrStream,
    flags: ExecModeFlags,
    config: &IemConfig,
) -> Result<TranslationBlock, CompileError> {
    let mode = flags.decode_mode();
    let rip0 = cpu.rip();
    let start_pc = cpu.linear_pc();
    let fault = |exception| CompileError::Fault {
        pc: start_pc,
        exception,
    };

    let phys_pc = stream.resolve(cpu, mem, start_pc).map_err(fault)?;
    let cs_lim = flags.needs_cs_lim_checks();
    let calls_per_inst = 1 + usize::from(cs_lim);
    let limits = config.limits;

    let mut b = TbBuilder {
        calls: Vec::new(),
        ranges: vec![PhysRange {
            start: phys_pc,
            len: 0,
        }],
        cb_pc: 0,
        instructions: 0,
    };

    loop {
        let first = b.instructions == 0;
        let ip = rip0.wrapping_add(b.cb_pc as u64);
        if !first && ip > ip_limit(mode) {
            break;
        }
        let pc = linear(cpu, mode, ip);

        if !first {
            if b.calls.len() + calls_per_inst > limits.max_calls {
                trace!("block ends: call cap");
                break;
            }
            if stream.resolve(cpu, mem, pc).is_err() {
                break;
            }
        }

        let mut buf = [0u8; MAX_INST_LEN];
        let avail = match stream.copy_bytes(mem, pc, &mut buf) {
            Ok(n) => n,
            Err(e) if first => return Err(fault(e)),
            Err(_) => break,
        };

        let mut second_page: Option<(u64, usize)> = None;
        let decoded = match decode(&buf[..avail], mode) {
            Err(DecodeError::UnexpectedEof) if avail < MAX_INST_LEN => {
                if !first {
                    // Non-first instructions never straddle a page.
                    trace!(pc = format_args!("{:#x}", pc), "block ends: page crossing");
                    break;
                }
                let next_pc = (pc & PAGE_MASK).wrapping_add(PAGE_SIZE);
                let phys2 = stream.resolve(cpu, mem, next_pc).map_err(fault)?;
                let more = stream
                    .copy_bytes(mem, next_pc, &mut buf[avail..])
                    .map_err(fault)?;
                let res = decode(&buf[..avail + more], mode);
                if let Some(len) = consumed_len(&res) {
                    second_page = Some((phys2, len - avail));
                }
                res
            }
            res => res,
        };

        let inst_len = consumed_len(&decoded).unwrap_or(1);
        if !first && b.cb_pc + inst_len > limits.max_opcode_bytes {
            trace!("block ends: opcode byte cap");
            break;
        }

        if cs_lim {
            b.push(ThreadedFunction::CheckCsLim, inst_len as u8, [inst_len as u64, 0, 0]);
        }

        let ends_block = match &decoded {
            Ok(inst) => {
                emit(&mut b, inst, &buf[..inst_len]);
                inst.block_effect().ends_block()
            }
            Err(err) => {
                debug!(
                    pc = format_args!("{:#x}", pc),
                    ?err,
                    "undecodable instruction; deferring"
                );
                let (lo, hi) = pack_bytes(&buf[..inst_len]);
                b.push(
                    ThreadedFunction::DeferToFull,
                    inst_len as u8,
                    [lo, hi, inst_len as u64],
                );
                true
            }
        };

        match second_page {
            Some((phys2, tail)) => {
                b.ranges[0].len += (inst_len - tail) as u32;
                b.ranges.push(PhysRange {
                    start: phys2,
                    len: tail as u32,
                });
            }
            None => b.ranges[0].len += inst_len as u32,
        }
        b.cb_pc += inst_len;
        b.instructions += 1;

        if ends_block || second_page.is_some() {
            break;
        }
        let next_pc = pc.wrapping_add(inst_len as u64);
        if next_pc & PAGE_MASK != pc & PAGE_MASK {
            break;
        }
    }

    let mut tb_flags = TbFlags::THREADED;
    if cs_lim {
        tb_flags |= TbFlags::CS_LIM_CHECKS;
    }
    debug!(
        pc = format_args!("{:#x}", start_pc),
        phys_pc = format_args!("{:#x}", phys_pc),
        calls = b.calls.len(),
        cb_pc = b.cb_pc,
        instructions = b.instructions,
        "compiled translation block"
    );
    Ok(TranslationBlock {
        phys_pc,
        pc: start_pc,
        flags,
        tb_flags,
        arch: ArchIdentity::from_cpu(cpu),
        cb_pc: b.cb_pc as u16,
        ranges: b.ranges,
        calls: b.calls,
        instruction_count: b.instructions,
    })
}

/// Bytes an instruction is known to occupy. An over-long encoding has
/// consumed the full 15 bytes; other decode failures have no length.
fn consumed_len(res: &Result<DecodedInst, DecodeError>) -> Option<usize> {
    match res {
        Ok(inst) => Some(usize::from(inst.length)),
        Err(DecodeError::TooLong) => Some(MAX_INST_LEN),
        Err(_) => None,
    }
}

fn reg_desc(prefixes: &Prefixes, index: u8, size: OperandSize) -> u64 {
    RegDesc::new(gpr_ref(index, size, prefixes.rex.is_some()), size).pack()
}

/// Emit the calls for one decoded instruction: a fast-path function when one
/// fits, otherwise `DeferToFull` with the raw bytes.
fn emit(b: &mut TbBuilder, inst: &DecodedInst, bytes: &[u8]) {
    let len = inst.length;
    let size = inst.operand_size;
    let p = &inst.prefixes;
    let opsize = u64::from(size.bytes());
    let disp = pack_i64(inst.imm_sext());

    let fast: Option<(ThreadedFunction, [u64; 3])> = if p.lock {
        None
    } else {
        match (inst.class, inst.rm) {
            (InstClass::Nop, _) => Some((ThreadedFunction::Nop, [0; 3])),
            (InstClass::MovRegImm, _) => Some((
                ThreadedFunction::MovRegImm,
                [reg_desc(p, inst.opcode_reg(), size), inst.imm, 0],
            )),
            (InstClass::MovRmReg, Some(RmOperand::Reg(r))) => Some((
                ThreadedFunction::MovRegReg,
                [reg_desc(p, r, size), reg_desc(p, inst.reg(), size), 0],
            )),
            (InstClass::MovRegRm, Some(RmOperand::Reg(r))) => Some((
                ThreadedFunction::MovRegReg,
                [reg_desc(p, inst.reg(), size), reg_desc(p, r, size), 0],
            )),
            (InstClass::MovRegRm, Some(RmOperand::Mem(m))) => Some((
                ThreadedFunction::LoadReg,
                [
                    reg_desc(p, inst.reg(), size),
                    EaDesc::from_mem(&m, inst.address_size).pack(),
                    pack_i64(m.disp),
                ],
            )),
            (InstClass::MovRmReg, Some(RmOperand::Mem(m))) => Some((
                ThreadedFunction::StoreReg,
                [
                    reg_desc(p, inst.reg(), size),
                    EaDesc::from_mem(&m, inst.address_size).pack(),
                    pack_i64(m.disp),
                ],
            )),
            (InstClass::AluRmReg, Some(RmOperand::Reg(r))) => {
                let dst = RegDesc::unpack(reg_desc(p, r, size));
                Some((
                    ThreadedFunction::AluRegReg,
                    [
                        pack_reg_with(dst, inst.alu_op() as u8),
                        reg_desc(p, inst.reg(), size),
                        0,
                    ],
                ))
            }
            (InstClass::AluRegRm, Some(RmOperand::Reg(r))) => {
                let dst = RegDesc::unpack(reg_desc(p, inst.reg(), size));
                Some((
                    ThreadedFunction::AluRegReg,
                    [pack_reg_with(dst, inst.alu_op() as u8), reg_desc(p, r, size), 0],
                ))
            }
            (InstClass::AluAccImm, _) => Some((
                ThreadedFunction::AluRegImm,
                [
                    pack_reg_with(RegDesc::new(0, size), inst.alu_op() as u8),
                    inst.imm_sext() as u64,
                    0,
                ],
            )),
            (InstClass::AluRmImm, Some(RmOperand::Reg(r))) => {
                let dst = RegDesc::unpack(reg_desc(p, r, size));
                Some((
                    ThreadedFunction::AluRegImm,
                    [pack_reg_with(dst, inst.alu_op() as u8), inst.imm_sext() as u64, 0],
                ))
            }
            (InstClass::IncDecReg, _) => Some((
                ThreadedFunction::IncDecReg,
                [
                    RegDesc::new(inst.opcode & 7, size).pack(),
                    u64::from(inst.opcode & 8 != 0),
                    0,
                ],
            )),
            (InstClass::IncDecRm, Some(RmOperand::Reg(r))) => Some((
                ThreadedFunction::IncDecReg,
                [
                    reg_desc(p, r, size),
                    u64::from(inst.modrm.is_some_and(|m| m.reg == 1)),
                    0,
                ],
            )),
            (InstClass::PushReg, _) => Some((
                ThreadedFunction::PushReg,
                [RegDesc::new(inst.opcode_reg(), size).pack(), 0, 0],
            )),
            (InstClass::PopReg, _) => Some((
                ThreadedFunction::PopReg,
                [RegDesc::new(inst.opcode_reg(), size).pack(), 0, 0],
            )),
            (InstClass::JmpRel, _) => Some((ThreadedFunction::JmpRel, [disp, opsize, 0])),
            (InstClass::Jcc, _) => Some((
                ThreadedFunction::JccRel,
                [disp, opsize, u64::from(inst.opcode & 0xF)],
            )),
            (InstClass::CallRel, _) => Some((ThreadedFunction::CallRel, [disp, opsize, 0])),
            (InstClass::Ret, _) => Some((ThreadedFunction::Ret, [opsize, 0, 0])),
            (InstClass::RetImm, _) => Some((ThreadedFunction::Ret, [opsize, inst.imm, 0])),
            (InstClass::Hlt, _) => Some((ThreadedFunction::Hlt, [0; 3])),
            _ => None,
        }
    };

    match fast {
        Some((function, params)) => b.push(function, len, params),
        None => {
            let (lo, hi) = pack_bytes(bytes);
            b.push(ThreadedFunction::DeferToFull, len, [lo, hi, u64::from(len)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuTarget;
    use crate::mem::FlatTestMemory;
    use crate::threaded::unpack_bytes;

    fn compile(cpu: &CpuState, mem: &mut FlatTestMemory) -> Result<TranslationBlock, CompileError> {
        let flags = ExecModeFlags::from_cpu(cpu, CpuTarget::Current, false);
        let mut stream = InstrStream::new();
        compile_block(cpu, mem, &mut stream, flags, &IemConfig::default())
    }

    #[test]
    fn branch_ends_block() {
        let mut mem = FlatTestMemory::new(0x3000);
        // inc eax; jmp $; nop
        mem.load(0x1000, &[0x40, 0xEB, 0xFE, 0x90]);
        let mut cpu = CpuState::new_flat32();
        cpu.set_rip(0x1000);
        let tb = compile(&cpu, &mut mem).unwrap();
        assert_eq!(tb.cb_pc, 3);
        assert_eq!(tb.instruction_count, 2);
        assert_eq!(tb.calls[1].function, ThreadedFunction::JmpRel);
        assert_eq!(tb.calls[1].off_opcode, 1);
    }

    #[test]
    fn first_instruction_crossing_a_page_gets_two_ranges() {
        let mut mem = FlatTestMemory::new(0x3000);
        // mov eax, imm32 split 2/3 over the 0x2000 boundary; then nop.
        mem.load(0x1FFE, &[0xB8, 0x01, 0x02, 0x03, 0x04, 0x90]);
        let mut cpu = CpuState::new_flat32();
        cpu.set_rip(0x1FFE);
        let tb = compile(&cpu, &mut mem).unwrap();
        assert_eq!(
            tb.ranges,
            vec![
                PhysRange { start: 0x1FFE, len: 2 },
                PhysRange { start: 0x2000, len: 3 },
            ]
        );
        assert_eq!(tb.cb_pc, 5);
        assert_eq!(tb.calls.len(), 1);
    }

    #[test]
    fn later_instruction_crossing_a_page_ends_block() {
        let mut mem = FlatTestMemory::new(0x3000);
        mem.load(0x1FFC, &[0x90, 0x90, 0xB8, 0x01, 0x02, 0x03, 0x04]);
        let mut cpu = CpuState::new_flat32();
        cpu.set_rip(0x1FFC);
        let tb = compile(&cpu, &mut mem).unwrap();
        assert_eq!(tb.cb_pc, 2);
        assert_eq!(tb.ranges.len(), 1);
    }

    #[test]
    fn non_flat_code_gets_cs_limit_checks() {
        let mut mem = FlatTestMemory::new(0x3000);
        mem.load(0x1000, &[0x90, 0xF4]);
        let mut cpu = CpuState::new_real_mode();
        cpu.set_rip(0x1000);
        let tb = compile(&cpu, &mut mem).unwrap();
        assert!(tb.tb_flags.contains(TbFlags::CS_LIM_CHECKS));
        let functions: Vec<_> = tb.calls.iter().map(|c| c.function).collect();
        assert_eq!(
            functions,
            vec![
                ThreadedFunction::CheckCsLim,
                ThreadedFunction::Nop,
                ThreadedFunction::CheckCsLim,
                ThreadedFunction::Hlt,
            ]
        );
    }

    #[test]
    fn undecodable_bytes_defer_and_end_block() {
        let mut mem = FlatTestMemory::new(0x3000);
        // 0F 04 is undefined.
        mem.load(0x1000, &[0x90, 0x0F, 0x04, 0x90]);
        let mut cpu = CpuState::new_flat32();
        cpu.set_rip(0x1000);
        let tb = compile(&cpu, &mut mem).unwrap();
        assert_eq!(tb.calls.len(), 2);
        assert_eq!(tb.calls[1].function, ThreadedFunction::DeferToFull);
        assert_eq!(tb.calls[1].params[2], 1);
        assert_eq!(tb.cb_pc, 2);
    }

    #[test]
    fn over_long_encoding_defers_all_fifteen_bytes() {
        let mut mem = FlatTestMemory::new(0x3000);
        // Fifteen operand-size prefixes with nothing after them, starting
        // five bytes before a page boundary.
        mem.load(0x1FFB, &[0x66; MAX_INST_LEN]);
        let mut cpu = CpuState::new_flat32();
        cpu.set_rip(0x1FFB);
        let tb = compile(&cpu, &mut mem).unwrap();
        assert_eq!(tb.calls.len(), 1);
        let call = &tb.calls[0];
        assert_eq!(call.function, ThreadedFunction::DeferToFull);
        assert_eq!(call.params[2], MAX_INST_LEN as u64);
        assert_eq!(unpack_bytes(call.params[0], call.params[1])[..MAX_INST_LEN], [0x66; MAX_INST_LEN]);
        assert_eq!(tb.cb_pc, MAX_INST_LEN as u16);
        assert_eq!(
            tb.ranges,
            vec![
                PhysRange { start: 0x1FFB, len: 5 },
                PhysRange { start: 0x2000, len: 10 },
            ]
        );
    }

    #[test]
    fn fault_on_first_fetch_is_an_error() {
        let mut mem = FlatTestMemory::new(0x3000);
        mem.unmap_page(0x1000);
        let mut cpu = CpuState::new_flat32();
        cpu.set_rip(0x1000);
        let err = compile(&cpu, &mut mem).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Fault {
                pc: 0x1000,
                exception: Exception::PageFault { .. }
            }
        ));
    }
}

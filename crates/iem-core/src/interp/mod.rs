//! Full-semantics fallback interpreter.
//!
//! Everything the threaded fast paths do not cover ends up here, either via a
//! `DeferToFull` call (raw bytes re-decoded at execution time) or via
//! [`step`] when the driver single-steps. The interpreter works on the same
//! [`ThreadedCtx`] as the threaded functions and follows the same RIP rule:
//! RIP only moves once the instruction has completed.

pub mod alu;

use iem_decoder::{
    decode, AddressSize, DecodeError, DecodeMode, DecodedInst, InstClass, MemOperand, OpcodeMap,
    OperandSize, RmOperand, SegmentReg, MAX_INST_LEN,
};
use tracing::trace;

use crate::exception::{AssistReason, Exception};
use crate::mem::{PAGE_MASK, PAGE_SIZE};
use crate::state::{
    gpr_ref, SegmentRegister, FLAG_AC, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_ID, FLAG_IF, FLAG_IOPL,
    FLAG_NT, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_TF, FLAG_ZF,
};
use crate::threaded::{CallResult, CallStatus, EaDesc, IoRequest, StopReason, ThreadedCtx};

use self::alu::{alu, eval_cond, inc_dec, logic_with_flags};

/// Flags `POPF`/`IRET` may change regardless of privilege.
const POPF_BASE_MASK: u64 =
    FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_TF | FLAG_DF | FLAG_OF | FLAG_NT | FLAG_AC | FLAG_ID;

/// An encoding past the 15-byte limit is `#GP(0)`; anything else that fails
/// to decode is `#UD`.
fn decode_fault(err: DecodeError) -> Exception {
    match err {
        DecodeError::TooLong => Exception::gp0(),
        DecodeError::UnexpectedEof | DecodeError::Invalid => Exception::InvalidOpcode,
    }
}

/// Decode `bytes` in the current code mode and execute the instruction.
pub fn execute_bytes(ctx: &mut ThreadedCtx<'_>, bytes: &[u8]) -> CallResult {
    let inst = decode(bytes, ctx.cpu.code_mode()).map_err(decode_fault)?;
    execute_decoded(ctx, &inst)
}

/// Fetch, decode and execute the instruction at CS:RIP.
pub fn step(ctx: &mut ThreadedCtx<'_>) -> CallResult {
    let pc = ctx.cpu.linear_pc();
    let cpl = ctx.cpu.cpl();
    let mode = ctx.cpu.code_mode();

    let mut buf = [0u8; MAX_INST_LEN];
    let in_page = ((PAGE_SIZE - (pc & !PAGE_MASK)) as usize).min(MAX_INST_LEN);
    let phys = ctx.mem.map_for_fetch(pc, cpl)?.phys_page | (pc & !PAGE_MASK);
    ctx.mem.read_phys(phys, &mut buf[..in_page])?;

    let mut avail = in_page;
    let inst = loop {
        match decode(&buf[..avail], mode) {
            Ok(inst) => break inst,
            Err(DecodeError::UnexpectedEof) if avail < MAX_INST_LEN => {
                let next = (pc & PAGE_MASK).wrapping_add(PAGE_SIZE);
                let phys = ctx.mem.map_for_fetch(next, cpl)?.phys_page;
                ctx.mem.read_phys(phys, &mut buf[avail..])?;
                avail = MAX_INST_LEN;
            }
            Err(err) => return Err(decode_fault(err)),
        }
    };

    if !ctx.cpu.is_64bit() {
        let last = ctx.cpu.rip().wrapping_add(u64::from(inst.length) - 1);
        if last > u64::from(ctx.cpu.seg(SegmentReg::Cs).limit) {
            return Err(Exception::gp0());
        }
    }
    execute_decoded(ctx, &inst)
}

pub fn execute_decoded(ctx: &mut ThreadedCtx<'_>, inst: &DecodedInst) -> CallResult {
    if inst.prefixes.lock && !inst.lock_is_valid() {
        return Err(Exception::InvalidOpcode);
    }

    let size = inst.operand_size;
    match inst.class {
        InstClass::Invalid | InstClass::Ud2 => Err(Exception::InvalidOpcode),
        InstClass::Unsupported => {
            trace!(
                map = ?inst.map,
                opcode = format_args!("{:#04x}", inst.opcode),
                "no interpreter semantics; handing back to the VMM"
            );
            Ok(CallStatus::Stop(StopReason::Assist(AssistReason::Unsupported)))
        }
        InstClass::Nop => retire(ctx, inst),

        InstClass::AluRmReg | InstClass::AluRegRm | InstClass::AluAccImm | InstClass::AluRmImm => {
            exec_alu(ctx, inst)
        }
        InstClass::Test => {
            let dest = read_rm(ctx, inst, size)?;
            let src = if inst.map == OpcodeMap::Primary && matches!(inst.opcode, 0xF6 | 0xF7) {
                inst.imm_sext() as u64
            } else {
                read_reg(ctx, inst, inst.reg(), size)
            };
            let mut fl = ctx.cpu.rflags();
            logic_with_flags(&mut fl, dest & src, size);
            ctx.cpu.set_rflags(fl);
            retire(ctx, inst)
        }
        InstClass::Xchg => {
            let a = read_rm(ctx, inst, size)?;
            let b = read_reg(ctx, inst, inst.reg(), size);
            write_rm(ctx, inst, size, b)?;
            write_reg(ctx, inst, inst.reg(), size, a);
            retire(ctx, inst)
        }
        InstClass::IncDecReg => {
            let reg = inst.opcode & 7;
            let val = ctx.cpu.read_gpr(reg, size);
            let mut fl = ctx.cpu.rflags();
            let res = inc_dec(&mut fl, val, inst.opcode & 8 != 0, size);
            ctx.cpu.write_gpr(reg, size, res);
            ctx.cpu.set_rflags(fl);
            retire(ctx, inst)
        }
        InstClass::IncDecRm => {
            let dec = inst.modrm.is_some_and(|m| m.reg == 1);
            let val = read_rm(ctx, inst, size)?;
            let mut fl = ctx.cpu.rflags();
            let res = inc_dec(&mut fl, val, dec, size);
            write_rm(ctx, inst, size, res)?;
            ctx.cpu.set_rflags(fl);
            retire(ctx, inst)
        }

        InstClass::MovRmReg => {
            let val = read_reg(ctx, inst, inst.reg(), size);
            write_rm(ctx, inst, size, val)?;
            retire(ctx, inst)
        }
        InstClass::MovRegRm => {
            let val = read_rm(ctx, inst, size)?;
            write_reg(ctx, inst, inst.reg(), size, val);
            retire(ctx, inst)
        }
        InstClass::MovRegImm => {
            write_reg(ctx, inst, inst.opcode_reg(), size, inst.imm);
            retire(ctx, inst)
        }
        InstClass::MovRmImm => {
            write_rm(ctx, inst, size, inst.imm_sext() as u64)?;
            retire(ctx, inst)
        }
        InstClass::Movzx | InstClass::Movsx => {
            let src_size = if inst.opcode & 1 == 0 {
                OperandSize::Bits8
            } else {
                OperandSize::Bits16
            };
            let raw = read_rm(ctx, inst, src_size)?;
            let val = if inst.class == InstClass::Movsx {
                sign_extend(raw, src_size)
            } else {
                raw
            };
            write_reg(ctx, inst, inst.reg(), size, val);
            retire(ctx, inst)
        }
        InstClass::Lea => {
            let Some(RmOperand::Mem(m)) = inst.rm else {
                return Err(Exception::InvalidOpcode);
            };
            let addr = mem_offset(ctx, inst, &m);
            write_reg(ctx, inst, inst.reg(), size, addr);
            retire(ctx, inst)
        }
        InstClass::MovFromSreg => {
            let sreg = sreg_operand(inst)?;
            let sel = u64::from(ctx.cpu.seg(sreg).selector);
            match inst.rm {
                Some(RmOperand::Reg(r)) => {
                    let width = if inst.prefixes.rex_w() {
                        OperandSize::Bits64
                    } else if ctx.cpu.code_mode() == DecodeMode::Bits16
                        || inst.prefixes.operand_size_override
                    {
                        OperandSize::Bits16
                    } else {
                        OperandSize::Bits32
                    };
                    ctx.cpu.write_gpr(r, width, sel);
                }
                _ => write_rm(ctx, inst, OperandSize::Bits16, sel)?,
            }
            retire(ctx, inst)
        }
        InstClass::MovToSreg => exec_load_sreg(ctx, inst),

        InstClass::PushReg => {
            let val = ctx.cpu.read_gpr(inst.opcode_reg(), size);
            ctx.push(size, val)?;
            retire(ctx, inst)
        }
        InstClass::PopReg => {
            let val = ctx.pop(size)?;
            ctx.cpu.write_gpr(inst.opcode_reg(), size, val);
            retire(ctx, inst)
        }
        InstClass::PushImm => {
            ctx.push(size, inst.imm_sext() as u64)?;
            retire(ctx, inst)
        }

        InstClass::JmpRel => {
            let target = next_rip(ctx, inst).wrapping_add(inst.imm_sext() as u64);
            ctx.branch_to(target, size)
        }
        InstClass::Jcc => {
            if eval_cond(ctx.cpu.rflags(), inst.cond()) {
                let target = next_rip(ctx, inst).wrapping_add(inst.imm_sext() as u64);
                ctx.branch_to(target, size)
            } else {
                retire(ctx, inst)
            }
        }
        InstClass::LoopRel => exec_loop(ctx, inst),
        InstClass::CallRel => {
            let ret = next_rip(ctx, inst);
            ctx.call_to(ret.wrapping_add(inst.imm_sext() as u64), ret, size)
        }
        InstClass::CallRm => {
            let target = read_rm(ctx, inst, size)?;
            let ret = next_rip(ctx, inst);
            ctx.call_to(target, ret, size)
        }
        InstClass::JmpRm => {
            let target = read_rm(ctx, inst, size)?;
            ctx.branch_to(target, size)
        }
        InstClass::Ret => ctx.ret_near(size, 0),
        InstClass::RetImm => ctx.ret_near(size, inst.imm),

        InstClass::FarJmp | InstClass::FarCall | InstClass::FarRet | InstClass::Iret => {
            if ctx.cpu.protected_mode() {
                return Ok(CallStatus::Stop(StopReason::Assist(AssistReason::SegmentLoad)));
            }
            exec_far_real(ctx, inst)
        }

        InstClass::Hlt => {
            if ctx.cpu.cpl() != 0 {
                return Err(Exception::gp0());
            }
            ctx.cpu.advance_rip(u64::from(inst.length));
            ctx.cpu.halted = true;
            Ok(CallStatus::Stop(StopReason::Halt))
        }
        InstClass::FlagOp => {
            match inst.opcode {
                0xF5 => ctx.cpu.set_flag(FLAG_CF, !ctx.cpu.get_flag(FLAG_CF)),
                0xF8 => ctx.cpu.set_flag(FLAG_CF, false),
                0xF9 => ctx.cpu.set_flag(FLAG_CF, true),
                0xFC => ctx.cpu.set_flag(FLAG_DF, false),
                0xFD => ctx.cpu.set_flag(FLAG_DF, true),
                _ => return Err(Exception::InvalidOpcode),
            }
            retire(ctx, inst)
        }
        InstClass::Cli => {
            check_if_privilege(ctx)?;
            ctx.cpu.set_flag(FLAG_IF, false);
            retire(ctx, inst)
        }
        InstClass::Sti => {
            check_if_privilege(ctx)?;
            ctx.cpu.set_flag(FLAG_IF, true);
            ctx.cpu.advance_rip(u64::from(inst.length));
            Ok(CallStatus::Break)
        }
        InstClass::Popf => {
            if ctx.cpu.v86_mode() && ctx.cpu.iopl() < 3 {
                return Err(Exception::gp0());
            }
            let val = ctx.pop(size)?;
            apply_popped_flags(ctx, val, size);
            ctx.cpu.advance_rip(u64::from(inst.length));
            Ok(CallStatus::Break)
        }
        InstClass::Int3 => software_interrupt(ctx, inst, 3),
        InstClass::IntImm => {
            if ctx.cpu.v86_mode() && ctx.cpu.iopl() < 3 {
                return Err(Exception::gp0());
            }
            software_interrupt(ctx, inst, inst.imm as u8)
        }
        InstClass::Into => {
            if ctx.cpu.get_flag(FLAG_OF) {
                software_interrupt(ctx, inst, 4)
            } else {
                retire(ctx, inst)
            }
        }
        InstClass::Io => Ok(CallStatus::Stop(StopReason::Io(io_request(inst)))),
        InstClass::MovCr => exec_mov_cr(ctx, inst),
        InstClass::System => {
            let reason = match (inst.map, inst.opcode) {
                (OpcodeMap::Secondary, 0x30 | 0x32) => AssistReason::Msr,
                _ => AssistReason::Privileged,
            };
            Ok(CallStatus::Stop(StopReason::Assist(reason)))
        }
        InstClass::Cpuid => Ok(CallStatus::Stop(StopReason::Assist(AssistReason::Cpuid))),
    }
}

fn retire(ctx: &mut ThreadedCtx<'_>, inst: &DecodedInst) -> CallResult {
    ctx.cpu.advance_rip(u64::from(inst.length));
    Ok(CallStatus::Continue)
}

fn next_rip(ctx: &ThreadedCtx<'_>, inst: &DecodedInst) -> u64 {
    ctx.cpu.rip().wrapping_add(u64::from(inst.length))
}

fn software_interrupt(ctx: &mut ThreadedCtx<'_>, inst: &DecodedInst, vector: u8) -> CallResult {
    ctx.cpu.advance_rip(u64::from(inst.length));
    Ok(CallStatus::Stop(StopReason::SoftwareInterrupt { vector }))
}

fn sign_extend(val: u64, from: OperandSize) -> u64 {
    let shift = 64 - from.bits();
    (((val << shift) as i64) >> shift) as u64
}

fn read_reg(ctx: &ThreadedCtx<'_>, inst: &DecodedInst, index: u8, size: OperandSize) -> u64 {
    ctx.cpu
        .read_gpr(gpr_ref(index, size, inst.prefixes.rex.is_some()), size)
}

fn write_reg(ctx: &mut ThreadedCtx<'_>, inst: &DecodedInst, index: u8, size: OperandSize, val: u64) {
    ctx.cpu
        .write_gpr(gpr_ref(index, size, inst.prefixes.rex.is_some()), size, val);
}

fn mem_offset(ctx: &ThreadedCtx<'_>, inst: &DecodedInst, m: &MemOperand) -> u64 {
    EaDesc::from_mem(m, inst.address_size).offset(ctx.cpu, m.disp, next_rip(ctx, inst))
}

fn read_rm(ctx: &mut ThreadedCtx<'_>, inst: &DecodedInst, size: OperandSize) -> Result<u64, Exception> {
    match inst.rm {
        Some(RmOperand::Reg(r)) => Ok(read_reg(ctx, inst, r, size)),
        Some(RmOperand::Mem(m)) => {
            let off = mem_offset(ctx, inst, &m);
            ctx.read_mem(m.segment, off, size)
        }
        None => Err(Exception::InvalidOpcode),
    }
}

fn write_rm(
    ctx: &mut ThreadedCtx<'_>,
    inst: &DecodedInst,
    size: OperandSize,
    val: u64,
) -> Result<(), Exception> {
    match inst.rm {
        Some(RmOperand::Reg(r)) => {
            write_reg(ctx, inst, r, size, val);
            Ok(())
        }
        Some(RmOperand::Mem(m)) => {
            let off = mem_offset(ctx, inst, &m);
            ctx.write_mem(m.segment, off, size, val)
        }
        None => Err(Exception::InvalidOpcode),
    }
}

fn exec_alu(ctx: &mut ThreadedCtx<'_>, inst: &DecodedInst) -> CallResult {
    let size = inst.operand_size;
    let op = inst.alu_op();
    let mut fl = ctx.cpu.rflags();
    match inst.class {
        InstClass::AluRegRm => {
            let dest = read_reg(ctx, inst, inst.reg(), size);
            let src = read_rm(ctx, inst, size)?;
            let res = alu(op, &mut fl, dest, src, size);
            if op.writes_result() {
                write_reg(ctx, inst, inst.reg(), size, res);
            }
        }
        InstClass::AluAccImm => {
            let dest = ctx.cpu.read_gpr(0, size);
            let res = alu(op, &mut fl, dest, inst.imm_sext() as u64, size);
            if op.writes_result() {
                ctx.cpu.write_gpr(0, size, res);
            }
        }
        _ => {
            let dest = read_rm(ctx, inst, size)?;
            let src = if inst.class == InstClass::AluRmImm {
                inst.imm_sext() as u64
            } else {
                read_reg(ctx, inst, inst.reg(), size)
            };
            let res = alu(op, &mut fl, dest, src, size);
            if op.writes_result() {
                write_rm(ctx, inst, size, res)?;
            }
        }
    }
    ctx.cpu.set_rflags(fl);
    retire(ctx, inst)
}

fn exec_loop(ctx: &mut ThreadedCtx<'_>, inst: &DecodedInst) -> CallResult {
    let count_size = match inst.address_size {
        AddressSize::Bits16 => OperandSize::Bits16,
        AddressSize::Bits32 => OperandSize::Bits32,
        AddressSize::Bits64 => OperandSize::Bits64,
    };
    let count = ctx.cpu.read_gpr(1, count_size);
    let zf = ctx.cpu.get_flag(FLAG_ZF);
    let (new_count, taken) = match inst.opcode {
        0xE3 => (count, count == 0),
        op => {
            let n = count.wrapping_sub(1) & count_size.mask();
            let cond = match op {
                0xE0 => !zf,
                0xE1 => zf,
                _ => true,
            };
            (n, n != 0 && cond)
        }
    };

    if taken {
        let target = next_rip(ctx, inst).wrapping_add(inst.imm_sext() as u64);
        let target = ctx.branch_target(target, inst.operand_size)?;
        ctx.cpu.write_gpr(1, count_size, new_count);
        ctx.cpu.set_rip(target);
        Ok(CallStatus::Continue)
    } else {
        ctx.cpu.write_gpr(1, count_size, new_count);
        retire(ctx, inst)
    }
}

fn sreg_operand(inst: &DecodedInst) -> Result<SegmentReg, Exception> {
    let index = inst.modrm.map_or(0, |m| m.reg);
    SegmentReg::from_index(index).ok_or(Exception::InvalidOpcode)
}

/// `MOV sreg, r/m16` and `POP ES/SS/DS`. Only real and V86 mode loads are
/// handled here; descriptor loads go to the VMM.
fn exec_load_sreg(ctx: &mut ThreadedCtx<'_>, inst: &DecodedInst) -> CallResult {
    if ctx.cpu.protected_mode() && !ctx.cpu.v86_mode() {
        return Ok(CallStatus::Stop(StopReason::Assist(AssistReason::SegmentLoad)));
    }

    let (sreg, selector) = if inst.map == OpcodeMap::Primary && inst.opcode == 0x8E {
        (sreg_operand(inst)?, read_rm(ctx, inst, OperandSize::Bits16)? as u16)
    } else {
        let sreg = SegmentReg::from_index(inst.opcode >> 3).ok_or(Exception::InvalidOpcode)?;
        (sreg, ctx.pop(inst.operand_size)? as u16)
    };

    *ctx.cpu.seg_mut(sreg) = SegmentRegister {
        attr: ctx.cpu.seg(sreg).attr,
        ..SegmentRegister::real_mode(selector)
    };
    ctx.cpu.advance_rip(u64::from(inst.length));
    if sreg == SegmentReg::Ss {
        // Loading SS holds off interrupts for one instruction.
        Ok(CallStatus::Break)
    } else {
        Ok(CallStatus::Continue)
    }
}

/// Far control transfers in real mode: CS is loaded as `selector << 4`.
fn exec_far_real(ctx: &mut ThreadedCtx<'_>, inst: &DecodedInst) -> CallResult {
    let size = inst.operand_size;
    let width = u64::from(size.bytes());

    let (offset, selector) = match inst.class {
        InstClass::FarJmp | InstClass::FarCall => match inst.rm {
            Some(RmOperand::Mem(m)) => {
                let off = mem_offset(ctx, inst, &m);
                let offset = ctx.read_mem(m.segment, off, size)?;
                let sel = ctx.read_mem(m.segment, off.wrapping_add(width), OperandSize::Bits16)?;
                (offset, sel as u16)
            }
            Some(RmOperand::Reg(_)) => return Err(Exception::InvalidOpcode),
            None => (inst.imm, inst.imm2),
        },
        _ => {
            let sp = ctx.cpu.stack_ptr();
            let ip = ctx.read_mem(SegmentReg::Ss, sp, size)?;
            let cs = ctx.read_mem(SegmentReg::Ss, sp.wrapping_add(width), size)?;
            (ip, cs as u16)
        }
    };

    let offset = offset & size.mask();
    if offset > 0xFFFF {
        return Err(Exception::gp0());
    }

    match inst.class {
        InstClass::FarCall => {
            let ret = next_rip(ctx, inst);
            let cs = u64::from(ctx.cpu.seg(SegmentReg::Cs).selector);
            let sp = ctx.cpu.stack_ptr();
            let frame = sp.wrapping_sub(2 * width) & ctx.cpu.stack_addr_size().mask();
            ctx.write_mem(SegmentReg::Ss, frame.wrapping_add(width), size, cs)?;
            ctx.write_mem(SegmentReg::Ss, frame, size, ret)?;
            ctx.cpu.set_stack_ptr(frame);
        }
        InstClass::FarRet => {
            let sp = ctx.cpu.stack_ptr();
            ctx.cpu
                .set_stack_ptr(sp.wrapping_add(2 * width).wrapping_add(inst.imm));
        }
        InstClass::Iret => {
            let sp = ctx.cpu.stack_ptr();
            let flags = ctx.read_mem(SegmentReg::Ss, sp.wrapping_add(2 * width), size)?;
            ctx.cpu.set_stack_ptr(sp.wrapping_add(3 * width));
            apply_popped_flags(ctx, flags, size);
        }
        _ => {}
    }

    *ctx.cpu.seg_mut(SegmentReg::Cs) = SegmentRegister::real_mode_code(selector);
    ctx.cpu.set_rip(offset);
    if inst.class == InstClass::Iret {
        Ok(CallStatus::Break)
    } else {
        Ok(CallStatus::Continue)
    }
}

fn check_if_privilege(ctx: &ThreadedCtx<'_>) -> Result<(), Exception> {
    if !ctx.cpu.protected_mode() {
        return Ok(());
    }
    let allowed = if ctx.cpu.v86_mode() {
        ctx.cpu.iopl() == 3
    } else {
        ctx.cpu.cpl() <= ctx.cpu.iopl()
    };
    if allowed {
        Ok(())
    } else {
        Err(Exception::gp0())
    }
}

/// Merge a popped flags image into RFLAGS with `POPF` privilege rules.
fn apply_popped_flags(ctx: &mut ThreadedCtx<'_>, val: u64, size: OperandSize) {
    let cpl = ctx.cpu.cpl();
    let mut mask = POPF_BASE_MASK;
    if cpl == 0 && !ctx.cpu.v86_mode() {
        mask |= FLAG_IOPL;
    }
    if cpl <= ctx.cpu.iopl() || ctx.cpu.v86_mode() {
        mask |= FLAG_IF;
    }
    mask &= size.mask();
    let old = ctx.cpu.rflags();
    ctx.cpu.set_rflags((old & !mask) | (val & mask));
}

fn io_request(inst: &DecodedInst) -> IoRequest {
    let size = match inst.operand_size {
        OperandSize::Bits8 => 1,
        OperandSize::Bits16 => 2,
        _ => 4,
    };
    let (port, string) = match inst.opcode {
        0xE4..=0xE7 => (Some(inst.imm as u16), false),
        0x6C..=0x6F => (None, true),
        _ => (None, false),
    };
    IoRequest {
        port,
        size,
        write: inst.opcode & 2 != 0,
        string,
        rep: string && inst.prefixes.rep.is_some(),
    }
}

fn exec_mov_cr(ctx: &mut ThreadedCtx<'_>, inst: &DecodedInst) -> CallResult {
    if ctx.cpu.cpl() != 0 {
        return Err(Exception::gp0());
    }
    let modrm = inst.modrm.ok_or(Exception::InvalidOpcode)?;
    let rex = inst.prefixes.rex.unwrap_or_default();
    let cr = modrm.reg | if rex.r() { 8 } else { 0 };
    // The r/m field always names a GPR, whatever ModRM.mod says.
    let gpr = modrm.rm | if rex.b() { 8 } else { 0 };
    let width = if ctx.cpu.is_64bit() {
        OperandSize::Bits64
    } else {
        OperandSize::Bits32
    };

    if cr == 8 {
        return Ok(CallStatus::Stop(StopReason::Assist(AssistReason::Privileged)));
    }

    if inst.opcode == 0x20 {
        let val = match cr {
            0 => ctx.cpu.cr0(),
            2 => ctx.cpu.cr2,
            3 => ctx.cpu.cr3(),
            4 => ctx.cpu.cr4(),
            _ => return Err(Exception::InvalidOpcode),
        };
        ctx.cpu.write_gpr(gpr, width, val);
        return retire(ctx, inst);
    }

    let val = ctx.cpu.read_gpr(gpr, width);
    match cr {
        0 => ctx.cpu.set_cr0(val),
        2 => ctx.cpu.cr2 = val,
        3 => ctx.cpu.set_cr3(val),
        4 => ctx.cpu.set_cr4(val),
        _ => return Err(Exception::InvalidOpcode),
    }
    ctx.cpu.advance_rip(u64::from(inst.length));
    if cr == 2 {
        Ok(CallStatus::Continue)
    } else {
        Ok(CallStatus::Break)
    }
}

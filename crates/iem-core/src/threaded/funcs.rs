//! Threaded function bodies.
//!
//! Parameter layouts are fixed by the emitter in `compile.rs`; see the
//! packing helpers in the parent module.

use iem_decoder::{AluOp, Cond, OperandSize, SegmentReg};

use super::{
    unpack_bytes, unpack_i64, unpack_reg_with, CallEntry, CallResult, CallStatus, EaDesc,
    RegDesc, StopReason, ThreadedCtx,
};
use crate::exception::Exception;
use crate::interp::alu::{alu, eval_cond, inc_dec};
use crate::interp::execute_bytes;

fn opsize(raw: u64) -> OperandSize {
    OperandSize::from_bytes(raw as u8).unwrap_or(OperandSize::Bits32)
}

fn next_rip(ctx: &ThreadedCtx<'_>, entry: &CallEntry) -> u64 {
    ctx.cpu.rip().wrapping_add(u64::from(entry.cb_opcode))
}

pub(super) fn nop(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    ctx.finish(entry)
}

/// Prelude call; does not retire the instruction.
pub(super) fn check_cs_lim(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let cs = ctx.cpu.seg(SegmentReg::Cs);
    let last = ctx.cpu.rip().wrapping_add(entry.params[0].saturating_sub(1));
    if last > u64::from(cs.limit) {
        return Err(Exception::gp0());
    }
    Ok(CallStatus::Continue)
}

pub(super) fn mov_reg_imm(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let dst = RegDesc::unpack(entry.params[0]);
    ctx.cpu.write_gpr(dst.reg, dst.size, entry.params[1]);
    ctx.finish(entry)
}

pub(super) fn mov_reg_reg(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let dst = RegDesc::unpack(entry.params[0]);
    let src = RegDesc::unpack(entry.params[1]);
    let val = ctx.cpu.read_gpr(src.reg, src.size);
    ctx.cpu.write_gpr(dst.reg, dst.size, val);
    ctx.finish(entry)
}

pub(super) fn load_reg(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let dst = RegDesc::unpack(entry.params[0]);
    let ea = EaDesc::unpack(entry.params[1]);
    let off = ea.offset(ctx.cpu, unpack_i64(entry.params[2]), next_rip(ctx, entry));
    let val = ctx.read_mem(ea.segment, off, dst.size)?;
    ctx.cpu.write_gpr(dst.reg, dst.size, val);
    ctx.finish(entry)
}

pub(super) fn store_reg(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let src = RegDesc::unpack(entry.params[0]);
    let ea = EaDesc::unpack(entry.params[1]);
    let off = ea.offset(ctx.cpu, unpack_i64(entry.params[2]), next_rip(ctx, entry));
    let val = ctx.cpu.read_gpr(src.reg, src.size);
    ctx.write_mem(ea.segment, off, src.size, val)?;
    ctx.finish(entry)
}

fn alu_into_reg(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry, src: u64) -> CallResult {
    let (dst, op) = unpack_reg_with(entry.params[0]);
    let op = AluOp::from_index(op);
    let dest = ctx.cpu.read_gpr(dst.reg, dst.size);
    let mut fl = ctx.cpu.rflags();
    let res = alu(op, &mut fl, dest, src, dst.size);
    if op.writes_result() {
        ctx.cpu.write_gpr(dst.reg, dst.size, res);
    }
    ctx.cpu.set_rflags(fl);
    ctx.finish(entry)
}

pub(super) fn alu_reg_reg(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let src = RegDesc::unpack(entry.params[1]);
    let val = ctx.cpu.read_gpr(src.reg, src.size);
    alu_into_reg(ctx, entry, val)
}

pub(super) fn alu_reg_imm(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    alu_into_reg(ctx, entry, entry.params[1])
}

pub(super) fn inc_dec_reg(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let reg = RegDesc::unpack(entry.params[0]);
    let val = ctx.cpu.read_gpr(reg.reg, reg.size);
    let mut fl = ctx.cpu.rflags();
    let res = inc_dec(&mut fl, val, entry.params[1] != 0, reg.size);
    ctx.cpu.write_gpr(reg.reg, reg.size, res);
    ctx.cpu.set_rflags(fl);
    ctx.finish(entry)
}

pub(super) fn push_reg(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let reg = RegDesc::unpack(entry.params[0]);
    let val = ctx.cpu.read_gpr(reg.reg, reg.size);
    ctx.push(reg.size, val)?;
    ctx.finish(entry)
}

pub(super) fn pop_reg(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let reg = RegDesc::unpack(entry.params[0]);
    let val = ctx.pop(reg.size)?;
    ctx.cpu.write_gpr(reg.reg, reg.size, val);
    ctx.finish(entry)
}

pub(super) fn jmp_rel(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let target = next_rip(ctx, entry).wrapping_add(entry.params[0]);
    ctx.branch_to(target, opsize(entry.params[1]))
}

pub(super) fn jcc_rel(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    if eval_cond(ctx.cpu.rflags(), Cond::from_nibble(entry.params[2] as u8)) {
        jmp_rel(ctx, entry)
    } else {
        ctx.finish(entry)
    }
}

pub(super) fn call_rel(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let ret = next_rip(ctx, entry);
    let target = ret.wrapping_add(entry.params[0]);
    ctx.call_to(target, ret, opsize(entry.params[1]))
}

pub(super) fn ret(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    ctx.ret_near(opsize(entry.params[0]), entry.params[1])
}

pub(super) fn hlt(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    if ctx.cpu.cpl() != 0 {
        return Err(Exception::gp0());
    }
    ctx.cpu.advance_rip(u64::from(entry.cb_opcode));
    ctx.cpu.halted = true;
    Ok(CallStatus::Stop(StopReason::Halt))
}

pub(super) fn defer_to_full(ctx: &mut ThreadedCtx<'_>, entry: &CallEntry) -> CallResult {
    let bytes = unpack_bytes(entry.params[0], entry.params[1]);
    let len = (entry.params[2] as usize).min(bytes.len());
    execute_bytes(ctx, &bytes[..len])
}

#[cfg(test)]
mod tests {
    use super::super::{pack_bytes, pack_i64, pack_reg_with, ThreadedFunction};
    use super::*;
    use crate::mem::FlatTestMemory;
    use crate::state::CpuState;

    fn entry(function: ThreadedFunction, cb_opcode: u8, params: [u64; 3]) -> CallEntry {
        CallEntry {
            function,
            cb_opcode,
            off_opcode: 0,
            idx_range: 0,
            params,
        }
    }

    #[test]
    fn alu_cmp_only_touches_flags() {
        let mut cpu = CpuState::new_flat32();
        let mut mem = FlatTestMemory::new(0x1000);
        let mut log = Vec::new();
        cpu.gpr[0] = 5;
        let mut ctx = ThreadedCtx::new(&mut cpu, &mut mem, &mut log);
        let dst = RegDesc::new(0, OperandSize::Bits32);
        let e = entry(
            ThreadedFunction::AluRegImm,
            3,
            [pack_reg_with(dst, AluOp::Cmp as u8), 5, 0],
        );
        assert_eq!(alu_reg_imm(&mut ctx, &e), Ok(CallStatus::Continue));
        assert_eq!(cpu.gpr[0], 5);
        assert!(cpu.get_flag(crate::state::FLAG_ZF));
        assert_eq!(cpu.rip(), 3);
    }

    #[test]
    fn jcc_not_taken_falls_through() {
        let mut cpu = CpuState::new_flat32();
        let mut mem = FlatTestMemory::new(0x1000);
        let mut log = Vec::new();
        cpu.set_rip(0x100);
        let mut ctx = ThreadedCtx::new(&mut cpu, &mut mem, &mut log);
        // je +0x10 with ZF clear
        let e = entry(ThreadedFunction::JccRel, 2, [pack_i64(0x10), 4, Cond::E as u64]);
        jcc_rel(&mut ctx, &e).unwrap();
        assert_eq!(cpu.rip(), 0x102);
    }

    #[test]
    fn cs_limit_check_faults_without_moving_rip() {
        let mut cpu = CpuState::new_flat32();
        let mut mem = FlatTestMemory::new(0x1000);
        let mut log = Vec::new();
        cpu.seg_mut(SegmentReg::Cs).limit = 0x1FF;
        cpu.set_rip(0x1FE);
        let mut ctx = ThreadedCtx::new(&mut cpu, &mut mem, &mut log);
        let e = entry(ThreadedFunction::CheckCsLim, 5, [5, 0, 0]);
        assert_eq!(check_cs_lim(&mut ctx, &e), Err(Exception::gp0()));
        assert_eq!(cpu.rip(), 0x1FE);
    }

    #[test]
    fn defer_to_full_runs_raw_bytes() {
        let mut cpu = CpuState::new_flat32();
        let mut mem = FlatTestMemory::new(0x1000);
        let mut log = Vec::new();
        let mut ctx = ThreadedCtx::new(&mut cpu, &mut mem, &mut log);
        // stc
        let (lo, hi) = pack_bytes(&[0xF9]);
        let e = entry(ThreadedFunction::DeferToFull, 1, [lo, hi, 1]);
        assert_eq!(defer_to_full(&mut ctx, &e), Ok(CallStatus::Continue));
        assert!(cpu.get_flag(crate::state::FLAG_CF));
        assert_eq!(cpu.rip(), 1);
    }
}

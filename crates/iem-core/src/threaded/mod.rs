//! Threaded calls: the unit of work a translation block is made of.
//!
//! A block is a flat list of [`CallEntry`]s. Each entry names a
//! [`ThreadedFunction`] and carries up to three opaque `u64` parameters that
//! were decided at compile time (register numbers, immediates, packed
//! addressing descriptors). The executor looks the function up in a
//! [`ThreadedFunctionTable`] and calls it with the vCPU context.
//!
//! Handlers leave RIP at the start of the instruction until it completes, so
//! a fault observed by the executor always points at the faulting instruction.

mod funcs;

use iem_decoder::{AddressSize, MemOperand, OperandSize, SegmentReg};

use crate::exception::{AssistReason, Exception};
use crate::mem::{AccessType, GuestMemory, PhysWrite};
use crate::state::{CpuState, SEG_ATTR_CODE, SEG_ATTR_WRITABLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ThreadedFunction {
    Nop,
    /// Raise `#GP(0)` if the instruction extends past the CS limit.
    CheckCsLim,
    MovRegImm,
    MovRegReg,
    LoadReg,
    StoreReg,
    AluRegReg,
    AluRegImm,
    IncDecReg,
    PushReg,
    PopReg,
    JmpRel,
    JccRel,
    CallRel,
    Ret,
    Hlt,
    /// Re-decode the raw instruction bytes and run them through the
    /// full-semantics interpreter.
    DeferToFull,
}

impl ThreadedFunction {
    pub const COUNT: usize = ThreadedFunction::DeferToFull as usize + 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEntry {
    pub function: ThreadedFunction,
    /// Length of the instruction this call belongs to.
    pub cb_opcode: u8,
    /// Offset of that instruction from the start of the block.
    pub off_opcode: u16,
    /// Index into the block's physical ranges holding the instruction start.
    pub idx_range: u8,
    pub params: [u64; 3],
}

/// Port I/O request handed back to the VMM. RIP still points at the
/// instruction; the collaborator completes and retires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    /// `None` means the port is taken from `DX`.
    pub port: Option<u16>,
    pub size: u8,
    pub write: bool,
    pub string: bool,
    pub rep: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Halt,
    Io(IoRequest),
    /// `INT n`/`INT3`/`INTO`; RIP has been advanced to the return address.
    SoftwareInterrupt { vector: u8 },
    Assist(AssistReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Continue,
    /// End the block early; the run loop resumes at the current RIP.
    Break,
    Stop(StopReason),
}

pub type CallResult = Result<CallStatus, Exception>;

pub type ThreadedHandler = fn(&mut ThreadedCtx<'_>, &CallEntry) -> CallResult;

#[derive(Clone, Copy)]
pub struct ThreadedFunctionInfo {
    pub name: &'static str,
    pub handler: ThreadedHandler,
    /// Number of meaningful entries in `CallEntry::params`.
    pub param_count: u8,
}

impl core::fmt::Debug for ThreadedFunctionInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadedFunctionInfo")
            .field("name", &self.name)
            .field("param_count", &self.param_count)
            .finish()
    }
}

#[derive(Debug)]
pub struct ThreadedFunctionTable {
    entries: [ThreadedFunctionInfo; ThreadedFunction::COUNT],
}

impl ThreadedFunctionTable {
    #[inline]
    pub fn get(&self, function: ThreadedFunction) -> &ThreadedFunctionInfo {
        &self.entries[function as usize]
    }
}

const fn info(name: &'static str, handler: ThreadedHandler, param_count: u8) -> ThreadedFunctionInfo {
    ThreadedFunctionInfo {
        name,
        handler,
        param_count,
    }
}

/// The default handler table, indexed by [`ThreadedFunction`].
pub static THREADED_FUNCTIONS: ThreadedFunctionTable = ThreadedFunctionTable {
    entries: [
        info("Nop", funcs::nop, 0),
        info("CheckCsLim", funcs::check_cs_lim, 1),
        info("MovRegImm", funcs::mov_reg_imm, 2),
        info("MovRegReg", funcs::mov_reg_reg, 2),
        info("LoadReg", funcs::load_reg, 3),
        info("StoreReg", funcs::store_reg, 3),
        info("AluRegReg", funcs::alu_reg_reg, 2),
        info("AluRegImm", funcs::alu_reg_imm, 2),
        info("IncDecReg", funcs::inc_dec_reg, 2),
        info("PushReg", funcs::push_reg, 1),
        info("PopReg", funcs::pop_reg, 1),
        info("JmpRel", funcs::jmp_rel, 2),
        info("JccRel", funcs::jcc_rel, 3),
        info("CallRel", funcs::call_rel, 2),
        info("Ret", funcs::ret, 2),
        info("Hlt", funcs::hlt, 0),
        info("DeferToFull", funcs::defer_to_full, 3),
    ],
};

// --- parameter packing -------------------------------------------------------

/// A register operand: register reference (see [`crate::state::gpr_ref`]) and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegDesc {
    pub reg: u8,
    pub size: OperandSize,
}

impl RegDesc {
    pub const fn new(reg: u8, size: OperandSize) -> Self {
        Self { reg, size }
    }

    pub fn pack(self) -> u64 {
        u64::from(self.reg) | (u64::from(self.size.bytes()) << 8)
    }

    pub fn unpack(raw: u64) -> Self {
        Self {
            reg: raw as u8,
            size: OperandSize::from_bytes((raw >> 8) as u8).unwrap_or(OperandSize::Bits64),
        }
    }
}

/// Pack a register descriptor with an extra small field in bits 16..=23.
pub fn pack_reg_with(reg: RegDesc, extra: u8) -> u64 {
    reg.pack() | (u64::from(extra) << 16)
}

pub fn unpack_reg_with(raw: u64) -> (RegDesc, u8) {
    (RegDesc::unpack(raw & 0xFFFF), (raw >> 16) as u8)
}

/// Displacements and relative branch offsets travel as sign-extended `u64`.
#[inline]
pub fn pack_i64(v: i64) -> u64 {
    v as u64
}

#[inline]
pub fn unpack_i64(v: u64) -> i64 {
    v as i64
}

/// Packed memory addressing form (everything but the displacement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EaDesc {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub segment: SegmentReg,
    pub addr_size: AddressSize,
    pub rip_relative: bool,
}

const EA_NO_REG: u64 = 0x1F;

impl EaDesc {
    pub fn from_mem(mem: &MemOperand, addr_size: AddressSize) -> Self {
        Self {
            base: mem.base,
            index: mem.index,
            scale: mem.scale,
            segment: mem.segment,
            addr_size,
            rip_relative: mem.rip_relative,
        }
    }

    pub fn pack(self) -> u64 {
        let base = self.base.map_or(EA_NO_REG, u64::from);
        let index = self.index.map_or(EA_NO_REG, u64::from);
        let scale_shift = u64::from(self.scale.trailing_zeros());
        let addr = match self.addr_size {
            AddressSize::Bits16 => 0,
            AddressSize::Bits32 => 1,
            AddressSize::Bits64 => 2,
        };
        base | (index << 5)
            | (scale_shift << 10)
            | ((self.segment.index() as u64) << 12)
            | (addr << 15)
            | (u64::from(self.rip_relative) << 17)
    }

    pub fn unpack(raw: u64) -> Self {
        let reg = |v: u64| (v != EA_NO_REG).then_some(v as u8);
        Self {
            base: reg(raw & 0x1F),
            index: reg((raw >> 5) & 0x1F),
            scale: 1 << ((raw >> 10) & 3),
            segment: SegmentReg::from_index(((raw >> 12) & 7) as u8).unwrap_or(SegmentReg::Ds),
            addr_size: match (raw >> 15) & 3 {
                0 => AddressSize::Bits16,
                1 => AddressSize::Bits32,
                _ => AddressSize::Bits64,
            },
            rip_relative: (raw >> 17) & 1 != 0,
        }
    }

    /// Segment offset of the operand. `next_rip` is the address of the
    /// following instruction (RIP-relative base).
    pub fn offset(&self, cpu: &CpuState, disp: i64, next_rip: u64) -> u64 {
        let mut addr = if self.rip_relative {
            next_rip
        } else {
            self.base.map_or(0, |b| cpu.gpr[b as usize])
        };
        if let Some(index) = self.index {
            addr = addr.wrapping_add(cpu.gpr[index as usize].wrapping_mul(u64::from(self.scale)));
        }
        addr.wrapping_add(disp as u64) & self.addr_size.mask()
    }
}

/// Pack up to 16 raw instruction bytes into two little-endian words.
pub fn pack_bytes(bytes: &[u8]) -> (u64, u64) {
    let mut buf = [0u8; 16];
    let n = bytes.len().min(16);
    buf[..n].copy_from_slice(&bytes[..n]);
    let mut lo = [0u8; 8];
    let mut hi = [0u8; 8];
    lo.copy_from_slice(&buf[..8]);
    hi.copy_from_slice(&buf[8..]);
    (u64::from_le_bytes(lo), u64::from_le_bytes(hi))
}

pub fn unpack_bytes(lo: u64, hi: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&lo.to_le_bytes());
    buf[8..].copy_from_slice(&hi.to_le_bytes());
    buf
}

// --- execution context -------------------------------------------------------

/// Everything a threaded function may touch.
pub struct ThreadedCtx<'a> {
    pub cpu: &'a mut CpuState,
    pub mem: &'a mut dyn GuestMemory,
    /// Physical spans written by committed guest stores, drained by the run loop.
    pub write_log: &'a mut Vec<PhysWrite>,
}

impl<'a> ThreadedCtx<'a> {
    pub fn new(
        cpu: &'a mut CpuState,
        mem: &'a mut dyn GuestMemory,
        write_log: &'a mut Vec<PhysWrite>,
    ) -> Self {
        Self { cpu, mem, write_log }
    }

    /// Retire the instruction `entry` belongs to.
    #[inline]
    pub fn finish(&mut self, entry: &CallEntry) -> CallResult {
        self.cpu.advance_rip(u64::from(entry.cb_opcode));
        Ok(CallStatus::Continue)
    }

    /// Apply segmentation to `offset` and return the linear address.
    pub fn linear(&self, seg: SegmentReg, offset: u64, len: usize, write: bool) -> Result<u64, Exception> {
        let fault = if seg == SegmentReg::Ss {
            Exception::StackFault(0)
        } else {
            Exception::gp0()
        };

        if self.cpu.is_64bit() {
            let base = match seg {
                SegmentReg::Fs | SegmentReg::Gs => self.cpu.seg(seg).base,
                _ => 0,
            };
            let linear = base.wrapping_add(offset);
            let last = linear.wrapping_add(len as u64 - 1);
            if !is_canonical(linear) || !is_canonical(last) {
                return Err(fault);
            }
            return Ok(linear);
        }

        let desc = self.cpu.seg(seg);
        let last = offset.wrapping_add(len as u64 - 1);
        if last > u64::from(desc.limit) || last < offset {
            return Err(fault);
        }
        if write && self.cpu.protected_mode() && !self.cpu.v86_mode() {
            let code = desc.attr & SEG_ATTR_CODE != 0;
            if code || desc.attr & SEG_ATTR_WRITABLE == 0 {
                return Err(fault);
            }
        }
        Ok(desc.base.wrapping_add(offset) & 0xFFFF_FFFF)
    }

    pub fn read_mem(&mut self, seg: SegmentReg, offset: u64, size: OperandSize) -> Result<u64, Exception> {
        let len = size.bytes() as usize;
        let linear = self.linear(seg, offset, len, false)?;
        let mapping = self
            .mem
            .map_for_access(linear, len, AccessType::Read, self.cpu.cpl())?;
        Ok(mapping.read_le())
    }

    pub fn write_mem(
        &mut self,
        seg: SegmentReg,
        offset: u64,
        size: OperandSize,
        val: u64,
    ) -> Result<(), Exception> {
        let len = size.bytes() as usize;
        let linear = self.linear(seg, offset, len, true)?;
        let mut mapping = self
            .mem
            .map_for_access(linear, len, AccessType::Write, self.cpu.cpl())?;
        mapping.write_le(val);
        self.mem.commit_and_unmap(mapping, self.write_log)
    }

    /// Push `val`. RSP is only updated once the store has succeeded.
    pub fn push(&mut self, size: OperandSize, val: u64) -> Result<(), Exception> {
        let sp = self.cpu.stack_ptr();
        let new_sp = sp.wrapping_sub(u64::from(size.bytes())) & self.cpu.stack_addr_size().mask();
        self.write_mem(SegmentReg::Ss, new_sp, size, val)?;
        self.cpu.set_stack_ptr(new_sp);
        Ok(())
    }

    pub fn pop(&mut self, size: OperandSize) -> Result<u64, Exception> {
        let sp = self.cpu.stack_ptr();
        let val = self.read_mem(SegmentReg::Ss, sp, size)?;
        self.cpu.set_stack_ptr(sp.wrapping_add(u64::from(size.bytes())));
        Ok(val)
    }

    /// Truncate a near branch target to the operand size and check it against
    /// the CS limit (or for canonical form in 64-bit mode).
    pub fn branch_target(&self, target: u64, size: OperandSize) -> Result<u64, Exception> {
        let target = target & size.mask();
        let ok = if self.cpu.is_64bit() {
            is_canonical(target)
        } else {
            target <= u64::from(self.cpu.seg(SegmentReg::Cs).limit)
        };
        if ok {
            Ok(target)
        } else {
            Err(Exception::gp0())
        }
    }

    pub fn branch_to(&mut self, target: u64, size: OperandSize) -> CallResult {
        let target = self.branch_target(target, size)?;
        self.cpu.set_rip(target);
        Ok(CallStatus::Continue)
    }

    /// Near `CALL`: the return address is pushed only once the target has
    /// been validated.
    pub fn call_to(&mut self, target: u64, return_rip: u64, size: OperandSize) -> CallResult {
        let target = self.branch_target(target, size)?;
        self.push(size, return_rip & size.mask())?;
        self.cpu.set_rip(target);
        Ok(CallStatus::Continue)
    }

    /// Near `RET`/`RET imm16`. RSP is left alone if the return address faults.
    pub fn ret_near(&mut self, size: OperandSize, release: u64) -> CallResult {
        let sp = self.cpu.stack_ptr();
        let ret = self.read_mem(SegmentReg::Ss, sp, size)?;
        let target = self.branch_target(ret, size)?;
        self.cpu
            .set_stack_ptr(sp.wrapping_add(u64::from(size.bytes())).wrapping_add(release));
        self.cpu.set_rip(target);
        Ok(CallStatus::Continue)
    }
}

pub fn is_canonical(addr: u64) -> bool {
    let upper = addr >> 47;
    upper == 0 || upper == 0x1_FFFF
}

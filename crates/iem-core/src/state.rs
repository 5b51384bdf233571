use bitflags::bitflags;
use iem_decoder::{AddressSize, DecodeMode, OperandSize, SegmentReg};

pub const FLAG_CF: u64 = 1 << 0;
pub const FLAG_PF: u64 = 1 << 2;
pub const FLAG_AF: u64 = 1 << 4;
pub const FLAG_ZF: u64 = 1 << 6;
pub const FLAG_SF: u64 = 1 << 7;
pub const FLAG_TF: u64 = 1 << 8;
pub const FLAG_IF: u64 = 1 << 9;
pub const FLAG_DF: u64 = 1 << 10;
pub const FLAG_OF: u64 = 1 << 11;
pub const FLAG_IOPL: u64 = 3 << 12;
pub const FLAG_NT: u64 = 1 << 14;
pub const FLAG_RF: u64 = 1 << 16;
pub const FLAG_VM: u64 = 1 << 17;
pub const FLAG_AC: u64 = 1 << 18;
pub const FLAG_ID: u64 = 1 << 21;

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_PG: u64 = 1 << 31;
pub const CR4_DE: u64 = 1 << 3;
pub const CR4_PAE: u64 = 1 << 5;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;

/// Segment access-rights bits (VMX layout: type 0-3, S 4, DPL 5-6, P 7, L 13, D/B 14, G 15).
pub const SEG_ATTR_ACCESSED: u32 = 1 << 0;
pub const SEG_ATTR_WRITABLE: u32 = 1 << 1;
pub const SEG_ATTR_CODE: u32 = 1 << 3;
pub const SEG_ATTR_S: u32 = 1 << 4;
pub const SEG_ATTR_DPL_SHIFT: u32 = 5;
pub const SEG_ATTR_P: u32 = 1 << 7;
pub const SEG_ATTR_L: u32 = 1 << 13;
pub const SEG_ATTR_D: u32 = 1 << 14;
pub const SEG_ATTR_G: u32 = 1 << 15;

/// Register references with this bit set name the legacy high-byte registers
/// (`AH`, `CH`, `DH`, `BH`) of GPR `ref & 3`.
pub const GPR_HIGH8: u8 = 0x10;

pub const RSP: u8 = 4;

/// Normalise a decoded register number into a register reference.
///
/// Without a REX prefix, byte registers 4..=7 are `AH..BH` rather than `SPL..DIL`.
pub const fn gpr_ref(index: u8, size: OperandSize, rex_present: bool) -> u8 {
    if matches!(size, OperandSize::Bits8) && !rex_present && index >= 4 && index < 8 {
        (index - 4) | GPR_HIGH8
    } else {
        index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attr: u32,
}

impl SegmentRegister {
    const DATA_RW: u32 = SEG_ATTR_P | SEG_ATTR_S | SEG_ATTR_WRITABLE | SEG_ATTR_ACCESSED;
    const CODE_RX: u32 = SEG_ATTR_P | SEG_ATTR_S | SEG_ATTR_CODE | SEG_ATTR_WRITABLE | SEG_ATTR_ACCESSED;

    /// Segment as loaded by a real-mode `MOV sreg`.
    pub fn real_mode(selector: u16) -> Self {
        Self {
            selector,
            base: u64::from(selector) << 4,
            limit: 0xFFFF,
            attr: Self::DATA_RW,
        }
    }

    /// Real-mode code segment.
    pub fn real_mode_code(selector: u16) -> Self {
        Self {
            attr: Self::CODE_RX,
            ..Self::real_mode(selector)
        }
    }

    pub fn flat_code32(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0xFFFF_FFFF,
            attr: Self::CODE_RX | SEG_ATTR_D | SEG_ATTR_G,
        }
    }

    pub fn flat_data32(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0xFFFF_FFFF,
            attr: Self::DATA_RW | SEG_ATTR_D | SEG_ATTR_G,
        }
    }

    pub fn code64(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0xFFFF_FFFF,
            attr: Self::CODE_RX | SEG_ATTR_L | SEG_ATTR_G,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.base == 0 && self.limit == 0xFFFF_FFFF
    }

    pub fn dpl(&self) -> u8 {
        ((self.attr >> SEG_ATTR_DPL_SHIFT) & 3) as u8
    }

    pub fn default_big(&self) -> bool {
        self.attr & SEG_ATTR_D != 0
    }
}

/// Which virtualization/SMM context the vCPU is executing in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecContext {
    #[default]
    Normal,
    Vmx {
        in_guest: bool,
    },
    Svm {
        in_guest: bool,
    },
    Smm,
}

bitflags! {
    /// Asynchronous requests that make the run loop return before the next block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ForceFlags: u32 {
        const INTERRUPT_PENDING = 1 << 0;
        const NMI_PENDING = 1 << 1;
        const EXIT_REQUEST = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct CpuState {
    pub gpr: [u64; 16],
    rip: u64,
    rflags: u64,
    pub segments: [SegmentRegister; 6],
    cr0: u64,
    pub cr2: u64,
    cr3: u64,
    cr4: u64,
    efer: u64,
    pub dr7: u64,
    pub context: ExecContext,
    pub force_flags: ForceFlags,
    pub halted: bool,
    translation_epoch: u64,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new_real_mode()
    }
}

impl CpuState {
    /// Power-on style real-mode state with all segments at selector 0.
    pub fn new_real_mode() -> Self {
        let mut segments = [SegmentRegister::real_mode(0); 6];
        segments[SegmentReg::Cs.index()] = SegmentRegister::real_mode_code(0);
        Self {
            gpr: [0; 16],
            rip: 0,
            rflags: 0x2,
            segments,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            efer: 0,
            dr7: 0x400,
            context: ExecContext::Normal,
            force_flags: ForceFlags::empty(),
            halted: false,
            translation_epoch: 0,
        }
    }

    /// 32-bit protected mode with flat 4 GiB segments, CPL 0.
    pub fn new_flat32() -> Self {
        let mut cpu = Self::new_real_mode();
        cpu.cr0 = CR0_PE;
        cpu.segments = [SegmentRegister::flat_data32(0x10); 6];
        cpu.segments[SegmentReg::Cs.index()] = SegmentRegister::flat_code32(0x08);
        cpu
    }

    /// 64-bit long mode, CPL 0.
    pub fn new_long64() -> Self {
        let mut cpu = Self::new_flat32();
        cpu.cr0 |= CR0_PG;
        cpu.cr4 |= CR4_PAE;
        cpu.efer = EFER_LME | EFER_LMA;
        cpu.segments[SegmentReg::Cs.index()] = SegmentRegister::code64(0x08);
        cpu
    }

    pub fn seg(&self, seg: SegmentReg) -> &SegmentRegister {
        &self.segments[seg.index()]
    }

    pub fn seg_mut(&mut self, seg: SegmentReg) -> &mut SegmentRegister {
        &mut self.segments[seg.index()]
    }

    pub fn protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    pub fn v86_mode(&self) -> bool {
        self.protected_mode() && self.rflags & FLAG_VM != 0
    }

    pub fn long_mode_active(&self) -> bool {
        self.efer & EFER_LMA != 0
    }

    /// Width of the current code segment.
    pub fn code_mode(&self) -> DecodeMode {
        let cs = self.seg(SegmentReg::Cs);
        if self.v86_mode() {
            DecodeMode::Bits16
        } else if self.long_mode_active() && cs.attr & SEG_ATTR_L != 0 {
            DecodeMode::Bits64
        } else if cs.default_big() {
            DecodeMode::Bits32
        } else {
            DecodeMode::Bits16
        }
    }

    pub fn is_64bit(&self) -> bool {
        self.code_mode() == DecodeMode::Bits64
    }

    pub fn cpl(&self) -> u8 {
        if !self.protected_mode() {
            0
        } else if self.v86_mode() {
            3
        } else {
            (self.seg(SegmentReg::Cs).selector & 3) as u8
        }
    }

    pub fn iopl(&self) -> u8 {
        ((self.rflags & FLAG_IOPL) >> 12) as u8
    }

    pub fn ip_mask(&self) -> u64 {
        match self.code_mode() {
            DecodeMode::Bits16 | DecodeMode::Bits32 => 0xFFFF_FFFF,
            DecodeMode::Bits64 => u64::MAX,
        }
    }

    pub fn rip(&self) -> u64 {
        self.rip
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip & self.ip_mask();
    }

    /// Advance RIP past an instruction, wrapping at the operand width of the
    /// code segment (16-bit code wraps at 64 KiB).
    pub fn advance_rip(&mut self, delta: u64) {
        let next = self.rip.wrapping_add(delta);
        self.rip = match self.code_mode() {
            DecodeMode::Bits16 => next & 0xFFFF,
            DecodeMode::Bits32 => next & 0xFFFF_FFFF,
            DecodeMode::Bits64 => next,
        };
    }

    /// Linear address of the next instruction (`CS.base + RIP`).
    pub fn linear_pc(&self) -> u64 {
        if self.is_64bit() {
            self.rip
        } else {
            self.seg(SegmentReg::Cs).base.wrapping_add(self.rip) & 0xFFFF_FFFF
        }
    }

    pub fn rflags(&self) -> u64 {
        self.rflags
    }

    pub fn set_rflags(&mut self, flags: u64) {
        // Bit 1 always reads as one.
        self.rflags = flags | 0x2;
    }

    pub fn get_flag(&self, mask: u64) -> bool {
        self.rflags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u64, val: bool) {
        if val {
            self.rflags |= mask;
        } else {
            self.rflags &= !mask;
        }
    }

    pub fn cr0(&self) -> u64 {
        self.cr0
    }

    pub fn cr3(&self) -> u64 {
        self.cr3
    }

    pub fn cr4(&self) -> u64 {
        self.cr4
    }

    pub fn efer(&self) -> u64 {
        self.efer
    }

    /// CR0/CR3/CR4/EFER writes change how linear addresses translate, so they
    /// bump the translation epoch and invalidate any cached fetch window.
    pub fn set_cr0(&mut self, val: u64) {
        self.cr0 = val;
        self.bump_translation_epoch();
    }

    pub fn set_cr3(&mut self, val: u64) {
        self.cr3 = val;
        self.bump_translation_epoch();
    }

    pub fn set_cr4(&mut self, val: u64) {
        self.cr4 = val;
        self.bump_translation_epoch();
    }

    pub fn set_efer(&mut self, val: u64) {
        self.efer = val;
        self.bump_translation_epoch();
    }

    pub fn translation_epoch(&self) -> u64 {
        self.translation_epoch
    }

    pub fn bump_translation_epoch(&mut self) {
        self.translation_epoch = self.translation_epoch.wrapping_add(1);
    }

    /// Read a register reference (see [`gpr_ref`]) at `size`.
    pub fn read_gpr(&self, reg: u8, size: OperandSize) -> u64 {
        if reg & GPR_HIGH8 != 0 {
            return (self.gpr[(reg & 3) as usize] >> 8) & 0xFF;
        }
        self.gpr[(reg & 0xF) as usize] & size.mask()
    }

    /// Write a register reference at `size` with x86 partial-register rules:
    /// 32-bit writes zero the upper half, 8/16-bit writes merge.
    pub fn write_gpr(&mut self, reg: u8, size: OperandSize, val: u64) {
        if reg & GPR_HIGH8 != 0 {
            let slot = &mut self.gpr[(reg & 3) as usize];
            *slot = (*slot & !0xFF00) | ((val & 0xFF) << 8);
            return;
        }
        let slot = &mut self.gpr[(reg & 0xF) as usize];
        *slot = match size {
            OperandSize::Bits64 => val,
            OperandSize::Bits32 => val & 0xFFFF_FFFF,
            OperandSize::Bits16 => (*slot & !0xFFFF) | (val & 0xFFFF),
            OperandSize::Bits8 => (*slot & !0xFF) | (val & 0xFF),
        };
    }

    /// Address size used for implicit stack accesses.
    pub fn stack_addr_size(&self) -> AddressSize {
        if self.is_64bit() {
            AddressSize::Bits64
        } else if self.seg(SegmentReg::Ss).default_big() && !self.v86_mode() {
            AddressSize::Bits32
        } else {
            AddressSize::Bits16
        }
    }

    pub fn stack_ptr(&self) -> u64 {
        self.gpr[RSP as usize] & self.stack_addr_size().mask()
    }

    pub fn set_stack_ptr(&mut self, val: u64) {
        let mask = self.stack_addr_size().mask();
        let slot = &mut self.gpr[RSP as usize];
        *slot = (*slot & !mask) | (val & mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_register_writes() {
        let mut cpu = CpuState::new_long64();
        cpu.gpr[0] = 0xFFFF_FFFF_FFFF_FFFF;
        cpu.write_gpr(0, OperandSize::Bits32, 1);
        assert_eq!(cpu.gpr[0], 1);
        cpu.write_gpr(gpr_ref(4, OperandSize::Bits8, false), OperandSize::Bits8, 0xAB);
        assert_eq!(cpu.gpr[0], 0xAB01);
        assert_eq!(cpu.read_gpr(GPR_HIGH8, OperandSize::Bits8), 0xAB);
        cpu.write_gpr(gpr_ref(4, OperandSize::Bits8, true), OperandSize::Bits8, 0x12);
        assert_eq!(cpu.gpr[4] & 0xFF, 0x12);
    }

    #[test]
    fn control_register_writes_bump_epoch() {
        let mut cpu = CpuState::new_flat32();
        let before = cpu.translation_epoch();
        cpu.set_cr3(0x1000);
        cpu.set_cr4(cpu.cr4() | CR4_PAE);
        assert_eq!(cpu.translation_epoch(), before + 2);
    }

    #[test]
    fn sixteen_bit_ip_wraps() {
        let mut cpu = CpuState::new_real_mode();
        cpu.set_rip(0xFFFE);
        cpu.advance_rip(3);
        assert_eq!(cpu.rip(), 1);
    }
}

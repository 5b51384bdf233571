//! Execution-mode flags: the part of the CPU state a translation block was
//! compiled against.
//!
//! Layout (32 bits):
//!
//! | Bits    | Meaning |
//! |---------|---------|
//! | 0..=1   | CPU mode (16/32/64) |
//! | 2       | 16-bit: pre-386 target; 32-bit: flat segments |
//! | 3       | protected mode |
//! | 4       | virtual-8086 mode |
//! | 6       | disregard `LOCK` |
//! | 8..=10  | pending breakpoints (instruction/data/I/O) |
//! | 12..=13 | CPL |
//! | 16..=19 | context: VMX, SVM, in-guest, SMM |

use bitflags::bitflags;
use iem_decoder::{DecodeMode, SegmentReg};

use crate::config::CpuTarget;
use crate::state::{CpuState, ExecContext, CR4_DE};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecModeFlags: u32 {
        const CPUMODE_32 = 0x01;
        const CPUMODE_64 = 0x02;
        const FLAT_OR_PRE_386 = 0x04;
        const PROT = 0x08;
        const V86 = 0x10;

        const DISREGARD_LOCK = 0x40;

        const PENDING_BRK_INSTR = 0x100;
        const PENDING_BRK_DATA = 0x200;
        const PENDING_BRK_IO = 0x400;

        const CPL_MASK = 0x3000;

        const VMX = 0x1_0000;
        const SVM = 0x2_0000;
        const IN_GUEST = 0x4_0000;
        const SMM = 0x8_0000;
    }
}

pub const MODE_MASK: u32 = 0x1F;
pub const CPUMODE_MASK: u32 = 0x03;
pub const CPL_SHIFT: u32 = 12;
pub const CTX_MASK: u32 = 0xF_0000;

/// Bits that participate in TB lookup. CPL and the virtualization context do
/// not change how code decodes, but SMM code must never run non-SMM blocks.
pub const KEY_MASK: u32 = !(ExecModeFlags::CPL_MASK.bits() | CTX_MASK) | ExecModeFlags::SMM.bits();

/// The valid values of the mode field (bits 0..=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExecMode {
    Real16 = 0x00,
    Pre386_16 = 0x04,
    Prot16 = 0x08,
    ProtPre386_16 = 0x0C,
    V86_16 = 0x18,
    Bits32 = 0x01,
    Flat32 = 0x05,
    Prot32 = 0x09,
    ProtFlat32 = 0x0D,
    Bits64 = 0x0A,
}

impl ExecMode {
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits & MODE_MASK {
            0x00 => Some(ExecMode::Real16),
            0x04 => Some(ExecMode::Pre386_16),
            0x08 => Some(ExecMode::Prot16),
            0x0C => Some(ExecMode::ProtPre386_16),
            0x18 => Some(ExecMode::V86_16),
            0x01 => Some(ExecMode::Bits32),
            0x05 => Some(ExecMode::Flat32),
            0x09 => Some(ExecMode::Prot32),
            0x0D => Some(ExecMode::ProtFlat32),
            0x0A => Some(ExecMode::Bits64),
            _ => None,
        }
    }

    pub const fn decode_mode(self) -> DecodeMode {
        match self as u32 & CPUMODE_MASK {
            0 => DecodeMode::Bits16,
            1 => DecodeMode::Bits32,
            _ => DecodeMode::Bits64,
        }
    }
}

impl ExecModeFlags {
    /// Derive the flags from live CPU state.
    pub fn from_cpu(cpu: &CpuState, target: CpuTarget, disregard_lock: bool) -> Self {
        let mut bits = match cpu.code_mode() {
            DecodeMode::Bits64 => ExecMode::Bits64 as u32,
            _ if cpu.v86_mode() => ExecMode::V86_16 as u32,
            DecodeMode::Bits32 => {
                let mut m = ExecMode::Bits32 as u32;
                if cpu.protected_mode() {
                    m |= Self::PROT.bits();
                }
                if flat_data_segments(cpu) {
                    m |= Self::FLAT_OR_PRE_386.bits();
                }
                m
            }
            DecodeMode::Bits16 => {
                let mut m = ExecMode::Real16 as u32;
                if cpu.protected_mode() {
                    m |= Self::PROT.bits();
                }
                if target.is_pre_386() {
                    m |= Self::FLAT_OR_PRE_386.bits();
                }
                m
            }
        };

        if disregard_lock {
            bits |= Self::DISREGARD_LOCK.bits();
        }
        bits |= pending_breakpoints(cpu);
        bits |= u32::from(cpu.cpl()) << CPL_SHIFT;
        bits |= match cpu.context {
            ExecContext::Normal => 0,
            ExecContext::Vmx { in_guest } => {
                Self::VMX.bits() | if in_guest { Self::IN_GUEST.bits() } else { 0 }
            }
            ExecContext::Svm { in_guest } => {
                Self::SVM.bits() | if in_guest { Self::IN_GUEST.bits() } else { 0 }
            }
            ExecContext::Smm => Self::SMM.bits(),
        };

        Self::from_bits_retain(bits)
    }

    pub fn mode(self) -> Option<ExecMode> {
        ExecMode::from_bits(self.bits())
    }

    pub fn decode_mode(self) -> DecodeMode {
        match self.bits() & CPUMODE_MASK {
            0 => DecodeMode::Bits16,
            1 => DecodeMode::Bits32,
            _ => DecodeMode::Bits64,
        }
    }

    pub fn cpl(self) -> u8 {
        ((self.bits() & Self::CPL_MASK.bits()) >> CPL_SHIFT) as u8
    }

    /// The bits compared on TB lookup.
    pub fn key(self) -> u32 {
        self.bits() & KEY_MASK
    }

    pub fn is_64bit(self) -> bool {
        self.bits() & CPUMODE_MASK == ExecMode::Bits64 as u32 & CPUMODE_MASK
    }

    /// 64-bit code or 32-bit code with flat CS/DS/ES/SS: segment base and
    /// limit cannot affect execution.
    pub fn is_flat(self) -> bool {
        self.is_64bit()
            || (self.bits() & CPUMODE_MASK == 1 && self.contains(Self::FLAT_OR_PRE_386))
    }

    /// Whether instructions must be checked against the CS limit as they run.
    pub fn needs_cs_lim_checks(self) -> bool {
        !self.is_flat()
    }
}

fn flat_data_segments(cpu: &CpuState) -> bool {
    [SegmentReg::Cs, SegmentReg::Ds, SegmentReg::Es, SegmentReg::Ss]
        .into_iter()
        .all(|s| cpu.seg(s).is_flat())
}

fn pending_breakpoints(cpu: &CpuState) -> u32 {
    let mut bits = 0;
    for i in 0..4 {
        if cpu.dr7 & (0b11 << (i * 2)) == 0 {
            continue;
        }
        bits |= match (cpu.dr7 >> (16 + i * 4)) & 0b11 {
            0b00 => ExecModeFlags::PENDING_BRK_INSTR.bits(),
            0b10 if cpu.cr4() & CR4_DE != 0 => ExecModeFlags::PENDING_BRK_IO.bits(),
            0b10 => 0,
            _ => ExecModeFlags::PENDING_BRK_DATA.bits(),
        };
    }
    bits
}

//! Translation blocks.

use bitflags::bitflags;
use iem_decoder::SegmentReg;

use crate::mem::PAGE_MASK;
use crate::mode::ExecModeFlags;
use crate::state::CpuState;
use crate::threaded::CallEntry;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TbFlags: u32 {
        /// Block is a threaded call list (the only kind this core builds).
        const THREADED = 1 << 0;
        /// Every instruction is preceded by a CS-limit check.
        const CS_LIM_CHECKS = 1 << 1;
    }
}

/// Architecture-specific part of a block's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchIdentity {
    X86 {
        cs_base: u64,
        cs_limit: u32,
        cs_sel: u16,
        cs_attr: u32,
    },
}

impl ArchIdentity {
    pub fn from_cpu(cpu: &CpuState) -> Self {
        let cs = cpu.seg(SegmentReg::Cs);
        ArchIdentity::X86 {
            cs_base: cs.base,
            cs_limit: cs.limit,
            cs_sel: cs.selector,
            cs_attr: cs.attr,
        }
    }

    /// Attributes always have to agree; base, limit and selector only
    /// matter when segmentation can affect the block (`flat == false`).
    pub fn matches(&self, other: &ArchIdentity, flat: bool) -> bool {
        let (
            ArchIdentity::X86 {
                cs_base,
                cs_limit,
                cs_sel,
                cs_attr,
            },
            ArchIdentity::X86 {
                cs_base: base2,
                cs_limit: limit2,
                cs_sel: sel2,
                cs_attr: attr2,
            },
        ) = (self, other);
        if cs_attr != attr2 {
            return false;
        }
        flat || (cs_base == base2 && cs_limit == limit2 && cs_sel == sel2)
    }
}

/// A guest-physical span of opcode bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysRange {
    pub start: u64,
    pub len: u32,
}

impl PhysRange {
    pub fn end(&self) -> u64 {
        self.start + u64::from(self.len)
    }

    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        len != 0 && self.len != 0 && start < self.end() && self.start < start.saturating_add(len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationBlock {
    /// Guest-physical address of the first opcode byte.
    pub phys_pc: u64,
    /// Guest linear address the block was compiled at.
    pub pc: u64,
    pub flags: ExecModeFlags,
    pub tb_flags: TbFlags,
    pub arch: ArchIdentity,
    /// Opcode bytes covered; equals the sum of `ranges` lengths.
    pub cb_pc: u16,
    /// At most two: the second only exists when the first instruction
    /// crosses a page boundary.
    pub ranges: Vec<PhysRange>,
    pub calls: Vec<CallEntry>,
    pub instruction_count: u16,
}

impl TranslationBlock {
    pub fn key(&self) -> u32 {
        self.flags.key()
    }

    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        self.ranges.iter().any(|r| r.overlaps(start, len))
    }

    /// Physical page holding the tail of a first instruction that crosses a
    /// page boundary. Only the first page is part of the cache key, so this
    /// one has to be re-checked against the current translation on reuse.
    pub fn second_page(&self) -> Option<u64> {
        self.ranges.get(1).map(|r| r.start & PAGE_MASK)
    }

    /// Physical pages touched by the block's opcode bytes.
    pub fn code_pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|r| {
            let first = r.start >> 12;
            let last = (r.end().saturating_sub(1)) >> 12;
            first..=last
        })
    }
}

/// Handle to a cached block. Stale handles (the slot was reused) never
/// resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TbHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_overlap_is_half_open() {
        let r = PhysRange {
            start: 0x1000,
            len: 7,
        };
        assert!(r.overlaps(0x1006, 1));
        assert!(!r.overlaps(0x1007, 16));
        assert!(!r.overlaps(0x0FF0, 0x10));
        assert!(r.overlaps(0x0FF0, 0x11));
        assert!(!r.overlaps(0x1000, 0));
    }

    #[test]
    fn flat_identity_ignores_base_and_limit() {
        let a = ArchIdentity::X86 {
            cs_base: 0,
            cs_limit: 0xFFFF_FFFF,
            cs_sel: 0x08,
            cs_attr: 0xC09B,
        };
        let b = ArchIdentity::X86 {
            cs_base: 0x1000,
            cs_limit: 0xFFFF,
            cs_sel: 0x10,
            cs_attr: 0xC09B,
        };
        assert!(a.matches(&b, true));
        assert!(!a.matches(&b, false));
    }
}

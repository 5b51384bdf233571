//! Per-vCPU instruction stream window.
//!
//! The window caches one translated code page. While the PC stays inside it,
//! resolving a PC to a physical address is plain arithmetic; anything else
//! takes the missed path, which drops the window and re-translates.

use iem_decoder::MAX_INST_LEN;
use tracing::trace;

use crate::exception::Exception;
use crate::mem::{GuestMemory, PAGE_MASK, PAGE_SIZE};
use crate::state::CpuState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct InstrStream {
    buf: Box<[u8; PAGE_SIZE as usize]>,
    /// Linear address of `buf[0]`.
    buf_pc: u64,
    /// Guest-physical address of `buf[0]`.
    phys_base: u64,
    /// Bytes of `buf` that have been read from guest memory.
    cb_buf: usize,
    /// Bytes covered by the mapping (0 when the window is invalid).
    cb_total: usize,
    /// CPU translation epoch the mapping was made under.
    epoch: u64,
    cpl: u8,
    stats: FetchStats,
}

impl Default for InstrStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrStream {
    pub fn new() -> Self {
        Self {
            buf: Box::new([0; PAGE_SIZE as usize]),
            buf_pc: 0,
            phys_base: 0,
            cb_buf: 0,
            cb_total: 0,
            epoch: 0,
            cpl: 0,
            stats: FetchStats::default(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cb_total != 0
    }

    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    /// Linear range `[start, end)` currently covered by the window.
    pub fn window(&self) -> Option<(u64, u64)> {
        self.is_valid()
            .then(|| (self.buf_pc, self.buf_pc + self.cb_total as u64))
    }

    pub fn invalidate(&mut self) {
        self.cb_buf = 0;
        self.cb_total = 0;
    }

    /// Drop the window if guest-physical `[start, start + len)` overlaps it.
    pub fn invalidate_phys(&mut self, start: u64, len: u64) {
        if !self.is_valid() || len == 0 {
            return;
        }
        let end = start.saturating_add(len);
        let win_end = self.phys_base + self.cb_total as u64;
        if start < win_end && self.phys_base < end {
            trace!(phys = format_args!("{:#x}", start), len, "fetch window invalidated by write");
            self.invalidate();
        }
    }

    fn in_window(&self, cpu: &CpuState, pc: u64) -> bool {
        self.is_valid()
            && self.epoch == cpu.translation_epoch()
            && self.cpl == cpu.cpl()
            && pc >= self.buf_pc
            && pc - self.buf_pc < self.cb_total as u64
    }

    /// Resolve a linear PC to its guest-physical address, re-establishing the
    /// window on a miss.
    pub fn resolve(
        &mut self,
        cpu: &CpuState,
        mem: &mut dyn GuestMemory,
        pc: u64,
    ) -> Result<u64, Exception> {
        if self.in_window(cpu, pc) {
            self.stats.hits += 1;
            return Ok(self.phys_base + (pc - self.buf_pc));
        }

        self.stats.misses += 1;
        self.invalidate();
        let mapping = mem.map_for_fetch(pc, cpu.cpl())?;
        self.buf_pc = pc & PAGE_MASK;
        self.phys_base = mapping.phys_page;
        self.cb_total = PAGE_SIZE as usize;
        self.cb_buf = 0;
        self.epoch = cpu.translation_epoch();
        self.cpl = cpu.cpl();
        trace!(
            pc = format_args!("{:#x}", pc),
            phys = format_args!("{:#x}", self.phys_base),
            "fetch window mapped"
        );
        Ok(self.phys_base + (pc - self.buf_pc))
    }

    /// Copy up to [`MAX_INST_LEN`] bytes starting at `pc` into `out`, stopping
    /// at the end of the window. `pc` must have been resolved first.
    ///
    /// Returns the number of bytes copied; fewer than `MAX_INST_LEN` means the
    /// window (page) ends there.
    pub fn copy_bytes(
        &mut self,
        mem: &mut dyn GuestMemory,
        pc: u64,
        out: &mut [u8],
    ) -> Result<usize, Exception> {
        debug_assert!(self.is_valid() && pc >= self.buf_pc);
        let off = (pc - self.buf_pc) as usize;
        let avail = self.cb_total.saturating_sub(off);
        let n = avail.min(out.len()).min(MAX_INST_LEN);
        self.ensure_loaded(mem, off + n)?;
        out[..n].copy_from_slice(&self.buf[off..off + n]);
        Ok(n)
    }

    fn ensure_loaded(&mut self, mem: &mut dyn GuestMemory, end: usize) -> Result<(), Exception> {
        if end <= self.cb_buf {
            return Ok(());
        }
        // Read in 64-byte chunks so a straight run of instructions does not
        // hit guest memory once per instruction.
        let end = end.next_multiple_of(64).min(self.cb_total);
        let start = self.cb_buf;
        mem.read_phys(self.phys_base + start as u64, &mut self.buf[start..end])?;
        self.cb_buf = end;
        Ok(())
    }
}

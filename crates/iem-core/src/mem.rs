//! Guest memory interface used by the recompiler.
//!
//! The recompiler never touches guest RAM directly: code bytes are fetched via
//! [`GuestMemory::map_for_fetch`] and data accesses go through a bounce buffer
//! obtained from [`GuestMemory::map_for_access`] and written back by
//! [`GuestMemory::commit_and_unmap`]. Implementations only have to provide
//! translation and physical reads/writes.

use std::collections::HashSet;

use crate::exception::Exception;

pub const PAGE_SIZE: u64 = 0x1000;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Largest single data access (`MappedAccess` capacity).
pub const MAX_ACCESS_LEN: usize = 16;

/// Page-fault error code bits.
pub const PFEC_P: u32 = 1 << 0;
pub const PFEC_W: u32 = 1 << 1;
pub const PFEC_U: u32 = 1 << 2;
pub const PFEC_I: u32 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

/// A guest-physical span produced by a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysWrite {
    pub start: u64,
    pub len: usize,
}

/// Result of mapping a code page for instruction fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchMapping {
    /// Guest-physical address of the page start.
    pub phys_page: u64,
}

/// Bounce buffer for one data access, possibly spanning two pages.
#[derive(Debug, Clone)]
pub struct MappedAccess {
    pub linear: u64,
    pub access: AccessType,
    len: usize,
    /// Physical address of the first byte.
    phys_first: u64,
    /// Bytes that live on the first page.
    first_len: usize,
    /// Physical address of the first byte on the second page, if the access
    /// crosses a page boundary.
    phys_second: Option<u64>,
    data: [u8; MAX_ACCESS_LEN],
}

impl MappedAccess {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// The guest-physical spans backing this access.
    pub fn phys_spans(&self) -> impl Iterator<Item = PhysWrite> + '_ {
        let first = PhysWrite {
            start: self.phys_first,
            len: self.first_len,
        };
        let second = self.phys_second.map(|start| PhysWrite {
            start,
            len: self.len - self.first_len,
        });
        core::iter::once(first).chain(second)
    }

    pub fn read_le(&self) -> u64 {
        self.data()
            .iter()
            .take(8)
            .enumerate()
            .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)))
    }

    pub fn write_le(&mut self, val: u64) {
        for (i, slot) in self.data_mut().iter_mut().take(8).enumerate() {
            *slot = (val >> (8 * i)) as u8;
        }
    }
}

pub trait GuestMemory {
    /// Translate a linear address. Faults are reported as architectural exceptions.
    fn translate(&mut self, linear: u64, access: AccessType, cpl: u8) -> Result<u64, Exception>;

    fn read_phys(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), Exception>;

    fn write_phys(&mut self, paddr: u64, src: &[u8]) -> Result<(), Exception>;

    /// Translate the code page containing `linear` for execution.
    fn map_for_fetch(&mut self, linear: u64, cpl: u8) -> Result<FetchMapping, Exception> {
        let phys = self.translate(linear & PAGE_MASK, AccessType::Execute, cpl)?;
        Ok(FetchMapping {
            phys_page: phys & PAGE_MASK,
        })
    }

    /// Map `len` bytes at `linear` into a bounce buffer.
    ///
    /// Both pages of a page-crossing access are translated before any data is
    /// touched, so a fault on the second page leaves guest memory unchanged.
    /// Reads and read-modify-write users get the current contents.
    fn map_for_access(
        &mut self,
        linear: u64,
        len: usize,
        access: AccessType,
        cpl: u8,
    ) -> Result<MappedAccess, Exception> {
        assert!(len <= MAX_ACCESS_LEN, "access of {len} bytes");
        let phys_first = self.translate(linear, access, cpl)?;
        let room = (PAGE_SIZE - (linear & !PAGE_MASK)) as usize;
        let (first_len, phys_second) = if len > room {
            let second_linear = (linear & PAGE_MASK).wrapping_add(PAGE_SIZE);
            (room, Some(self.translate(second_linear, access, cpl)?))
        } else {
            (len, None)
        };

        let mut mapping = MappedAccess {
            linear,
            access,
            len,
            phys_first,
            first_len,
            phys_second,
            data: [0; MAX_ACCESS_LEN],
        };
        self.read_phys(phys_first, &mut mapping.data[..first_len])?;
        if let Some(second) = phys_second {
            self.read_phys(second, &mut mapping.data[first_len..len])?;
        }
        Ok(mapping)
    }

    /// Write back a mapping obtained with [`AccessType::Write`], appending
    /// each physical span to `written` as soon as it lands. A failure on the
    /// second span still leaves the first one recorded.
    fn commit_and_unmap(
        &mut self,
        mapping: MappedAccess,
        written: &mut Vec<PhysWrite>,
    ) -> Result<(), Exception> {
        if mapping.access != AccessType::Write {
            return Ok(());
        }
        let mut off = 0;
        for span in mapping.phys_spans() {
            self.write_phys(span.start, &mapping.data[off..off + span.len])?;
            written.push(span);
            off += span.len;
        }
        Ok(())
    }
}

/// Identity-mapped guest memory used by tests.
///
/// Pages can be unmapped (translation raises `#PF` not-present) or
/// write-protected (`#PF` protection violation on write).
#[derive(Debug, Clone)]
pub struct FlatTestMemory {
    mem: Vec<u8>,
    unmapped: HashSet<u64>,
    write_protected: HashSet<u64>,
}

impl FlatTestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            unmapped: HashSet::new(),
            write_protected: HashSet::new(),
        }
    }

    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        self.mem[start..end].copy_from_slice(data);
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        let start = addr as usize;
        let end = start + len;
        &self.mem[start..end]
    }

    pub fn unmap_page(&mut self, addr: u64) {
        self.unmapped.insert(addr & PAGE_MASK);
    }

    pub fn map_page(&mut self, addr: u64) {
        self.unmapped.remove(&(addr & PAGE_MASK));
    }

    pub fn write_protect_page(&mut self, addr: u64) {
        self.write_protected.insert(addr & PAGE_MASK);
    }

    fn phys_range(&self, paddr: u64, len: usize) -> Result<core::ops::Range<usize>, Exception> {
        let start = usize::try_from(paddr).map_err(|_| Exception::gp0())?;
        let end = start.checked_add(len).ok_or(Exception::gp0())?;
        if end > self.mem.len() {
            return Err(Exception::gp0());
        }
        Ok(start..end)
    }
}

impl GuestMemory for FlatTestMemory {
    fn translate(&mut self, linear: u64, access: AccessType, cpl: u8) -> Result<u64, Exception> {
        let page = linear & PAGE_MASK;
        let mut error_code = 0;
        if access == AccessType::Write {
            error_code |= PFEC_W;
        }
        if access == AccessType::Execute {
            error_code |= PFEC_I;
        }
        if cpl == 3 {
            error_code |= PFEC_U;
        }

        if self.unmapped.contains(&page) || linear >= self.mem.len() as u64 {
            return Err(Exception::PageFault {
                addr: linear,
                error_code,
            });
        }
        if access == AccessType::Write && self.write_protected.contains(&page) {
            return Err(Exception::PageFault {
                addr: linear,
                error_code: error_code | PFEC_P,
            });
        }
        Ok(linear)
    }

    fn read_phys(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), Exception> {
        let range = self.phys_range(paddr, dst.len())?;
        dst.copy_from_slice(&self.mem[range]);
        Ok(())
    }

    fn write_phys(&mut self, paddr: u64, src: &[u8]) -> Result<(), Exception> {
        let range = self.phys_range(paddr, src.len())?;
        self.mem[range].copy_from_slice(src);
        Ok(())
    }
}

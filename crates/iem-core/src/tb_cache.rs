//! Translation-block cache.
//!
//! Blocks live in an arena of generation-tagged slots. A fixed power-of-two
//! bucket array chains blocks by `(phys_pc, key)` hash, and an intrusive
//! doubly-linked list keeps every live block in recency order for LRU
//! eviction. Both structures store slot indices, never pointers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::mode::ExecModeFlags;
use crate::tb::{ArchIdentity, TbHandle, TranslationBlock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TbCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    /// Blocks removed by [`TbCache::invalidate_phys_range`].
    pub invalidations: u64,
}

#[derive(Debug)]
struct Entry {
    tb: Arc<TranslationBlock>,
    bucket: usize,
    hash_next: Option<u32>,
    lru_prev: Option<u32>,
    lru_next: Option<u32>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Debug)]
pub struct TbCache {
    slots: Vec<Slot>,
    free: Vec<u32>,
    buckets: Box<[Option<u32>]>,
    /// Most recently used.
    lru_head: Option<u32>,
    /// Least recently used; evicted first.
    lru_tail: Option<u32>,
    len: usize,
    capacity: usize,
    /// Physical page number -> number of live blocks with code on it.
    code_pages: HashMap<u64, u32>,
    stats: TbCacheStats,
}

#[inline]
fn hash(phys_pc: u64, key: u32) -> u64 {
    let mut x = phys_pc.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ u64::from(key).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    x ^= x >> 33;
    x
}

impl TbCache {
    pub fn new(capacity: usize, hash_bits: u32) -> Self {
        let buckets = 1usize << hash_bits.clamp(1, 24);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: vec![None; buckets].into_boxed_slice(),
            lru_head: None,
            lru_tail: None,
            len: 0,
            capacity: capacity.max(1),
            code_pages: HashMap::new(),
            stats: TbCacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> TbCacheStats {
        self.stats
    }

    #[inline]
    fn bucket_of(&self, phys_pc: u64, key: u32) -> usize {
        hash(phys_pc, key) as usize & (self.buckets.len() - 1)
    }

    fn entry(&self, index: u32) -> Option<&Entry> {
        self.slots.get(index as usize)?.entry.as_ref()
    }

    fn entry_mut(&mut self, index: u32) -> Option<&mut Entry> {
        self.slots.get_mut(index as usize)?.entry.as_mut()
    }

    fn handle(&self, index: u32) -> TbHandle {
        TbHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn find(&self, phys_pc: u64, flags: ExecModeFlags, arch: &ArchIdentity) -> Option<u32> {
        let key = flags.key();
        let flat = flags.is_flat();
        let mut cur = self.buckets[self.bucket_of(phys_pc, key)];
        while let Some(index) = cur {
            let entry = self.entry(index)?;
            let tb = &entry.tb;
            if tb.phys_pc == phys_pc && tb.key() == key && tb.arch.matches(arch, flat) {
                return Some(index);
            }
            cur = entry.hash_next;
        }
        None
    }

    /// Find the block for `(phys_pc, flags, arch)`. Only the key-masked part
    /// of `flags` takes part in the comparison. A hit refreshes recency.
    pub fn lookup(
        &mut self,
        phys_pc: u64,
        flags: ExecModeFlags,
        arch: &ArchIdentity,
    ) -> Option<TbHandle> {
        match self.find(phys_pc, flags, arch) {
            Some(index) => {
                self.stats.hits += 1;
                self.lru_unlink(index);
                self.lru_push_front(index);
                Some(self.handle(index))
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn get(&self, handle: TbHandle) -> Option<&TranslationBlock> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref().map(|e| &*e.tb)
    }

    pub fn get_cloned(&self, handle: TbHandle) -> Option<Arc<TranslationBlock>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref().map(|e| Arc::clone(&e.tb))
    }

    /// Insert a block, replacing any block with the same identity and
    /// evicting the least recently used one when the cache is full.
    pub fn insert(&mut self, tb: TranslationBlock) -> TbHandle {
        if let Some(old) = self.find(tb.phys_pc, tb.flags, &tb.arch) {
            self.unlink(old);
        }
        while self.len >= self.capacity {
            let Some(victim) = self.lru_tail else { break };
            if let Some(entry) = self.entry(victim) {
                debug!(
                    phys_pc = format_args!("{:#x}", entry.tb.phys_pc),
                    "evicting translation block"
                );
            }
            self.unlink(victim);
            self.stats.evictions += 1;
        }

        for page in tb.code_pages() {
            *self.code_pages.entry(page).or_insert(0) += 1;
        }

        let key = tb.key();
        let bucket = self.bucket_of(tb.phys_pc, key);
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        debug!(
            phys_pc = format_args!("{:#x}", tb.phys_pc),
            pc = format_args!("{:#x}", tb.pc),
            key = format_args!("{:#x}", key),
            calls = tb.calls.len(),
            "inserted translation block"
        );
        self.slots[index as usize].entry = Some(Entry {
            tb: Arc::new(tb),
            bucket,
            hash_next: self.buckets[bucket],
            lru_prev: None,
            lru_next: None,
        });
        self.buckets[bucket] = Some(index);
        self.lru_push_front(index);
        self.len += 1;
        self.stats.inserts += 1;
        self.handle(index)
    }

    pub fn remove(&mut self, handle: TbHandle) -> Option<Arc<TranslationBlock>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation || slot.entry.is_none() {
            return None;
        }
        self.unlink(handle.index)
    }

    /// Cheap pre-check: does any cached block have code on a page touched by
    /// `[start, start + len)`?
    pub fn contains_code(&self, start: u64, len: u64) -> bool {
        if len == 0 || self.code_pages.is_empty() {
            return false;
        }
        let first = start >> 12;
        let last = start.saturating_add(len - 1) >> 12;
        (first..=last).any(|page| self.code_pages.contains_key(&page))
    }

    /// Drop every block whose opcode bytes intersect `[start, start + len)`.
    /// Returns the number of blocks removed.
    pub fn invalidate_phys_range(&mut self, start: u64, len: u64) -> usize {
        if !self.contains_code(start, len) {
            return 0;
        }
        let victims: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let entry = slot.entry.as_ref()?;
                entry.tb.overlaps(start, len).then_some(i as u32)
            })
            .collect();
        for &index in &victims {
            self.unlink(index);
        }
        if !victims.is_empty() {
            self.stats.invalidations += victims.len() as u64;
            debug!(
                start = format_args!("{:#x}", start),
                len,
                removed = victims.len(),
                "invalidated translation blocks"
            );
        }
        victims.len()
    }

    pub fn flush(&mut self) {
        for slot in &mut self.slots {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.buckets.fill(None);
        self.lru_head = None;
        self.lru_tail = None;
        self.code_pages.clear();
        self.len = 0;
        debug!("flushed translation block cache");
    }

    /// Live blocks, most recently used first.
    pub fn iter(&self) -> impl Iterator<Item = (TbHandle, &TranslationBlock)> + '_ {
        let mut cur = self.lru_head;
        core::iter::from_fn(move || {
            let index = cur?;
            let entry = self.entry(index)?;
            cur = entry.lru_next;
            Some((self.handle(index), &*entry.tb))
        })
    }

    /// Remove a live slot from every structure and recycle it.
    fn unlink(&mut self, index: u32) -> Option<Arc<TranslationBlock>> {
        self.lru_unlink(index);

        let (bucket, hash_next) = {
            let entry = self.entry(index)?;
            (entry.bucket, entry.hash_next)
        };
        if self.buckets[bucket] == Some(index) {
            self.buckets[bucket] = hash_next;
        } else {
            let mut cur = self.buckets[bucket];
            while let Some(i) = cur {
                let next = self.entry(i)?.hash_next;
                if next == Some(index) {
                    if let Some(prev) = self.entry_mut(i) {
                        prev.hash_next = hash_next;
                    }
                    break;
                }
                cur = next;
            }
        }

        let slot = &mut self.slots[index as usize];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;

        for page in entry.tb.code_pages() {
            if let Some(count) = self.code_pages.get_mut(&page) {
                *count -= 1;
                if *count == 0 {
                    self.code_pages.remove(&page);
                }
            }
        }
        Some(entry.tb)
    }

    fn lru_unlink(&mut self, index: u32) {
        let Some(entry) = self.entry_mut(index) else {
            return;
        };
        let (prev, next) = (entry.lru_prev.take(), entry.lru_next.take());
        match prev {
            Some(p) => {
                if let Some(e) = self.entry_mut(p) {
                    e.lru_next = next;
                }
            }
            None => self.lru_head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.entry_mut(n) {
                    e.lru_prev = prev;
                }
            }
            None => self.lru_tail = prev,
        }
    }

    fn lru_push_front(&mut self, index: u32) {
        let old_head = self.lru_head;
        if let Some(entry) = self.entry_mut(index) {
            entry.lru_prev = None;
            entry.lru_next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(e) = self.entry_mut(h) {
                    e.lru_prev = Some(index);
                }
            }
            None => self.lru_tail = Some(index),
        }
        self.lru_head = Some(index);
    }
}

/// A cache shared between vCPUs. Every operation takes the lock; blocks are
/// handed out as `Arc`s so execution never holds it.
#[derive(Debug, Clone)]
pub struct SharedTbCache {
    inner: Arc<Mutex<TbCache>>,
}

impl SharedTbCache {
    pub fn new(cache: TbCache) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    /// Run `f` with the cache locked. A poisoned lock is recovered: the cache
    /// has no invariants that a panicking reader could break halfway.
    pub fn with<R>(&self, f: impl FnOnce(&mut TbCache) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn lookup_cloned(
        &self,
        phys_pc: u64,
        flags: ExecModeFlags,
        arch: &ArchIdentity,
    ) -> Option<Arc<TranslationBlock>> {
        self.with(|cache| {
            let handle = cache.lookup(phys_pc, flags, arch)?;
            cache.get_cloned(handle)
        })
    }

    pub fn insert(&self, tb: TranslationBlock) -> TbHandle {
        self.with(|cache| cache.insert(tb))
    }

    pub fn invalidate_phys_range(&self, start: u64, len: u64) -> usize {
        self.with(|cache| cache.invalidate_phys_range(start, len))
    }

    pub fn flush(&self) {
        self.with(TbCache::flush)
    }

    pub fn stats(&self) -> TbCacheStats {
        self.with(|cache| cache.stats())
    }

    pub fn len(&self) -> usize {
        self.with(|cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

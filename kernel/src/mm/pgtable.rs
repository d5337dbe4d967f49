//! Software-walked page tables.
//!
//! Four lookup levels of 512 entries each, translating a process virtual
//! address to the kernel virtual address of its backing page. Nothing here
//! is ever handed to an MMU; the memory node walks these tables in software
//! on every miss and flush.
//!
//! Directory slots initialize lazily and never move once set, so walkers
//! hold no lock above the leaf. Each leaf table pairs its entry array with
//! its own lock (split PTL): installers re-check the entry under that lock,
//! and racers that lose the re-check back off.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard, Once};

use crate::config::{PAGE_MASK, PAGE_SHIFT};

/// Entries per table at every level.
pub const PTRS_PER_TABLE: usize = 512;

const LEVEL_BITS: u32 = 9;

bitflags! {
    /// Attribute bits of a leaf entry, in the x86 bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT  = 1 << 0;
        const WRITE    = 1 << 1;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
    }
}

/// One leaf entry: a page-aligned kernel virtual address in the frame bits
/// plus [`PteFlags`] in the low bits. The all-zero value means "never
/// populated".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    pub const fn none() -> Self {
        Pte(0)
    }

    pub fn new(page_kva: u64, prot: PteFlags) -> Self {
        Pte((page_kva & PAGE_MASK) | prot.bits())
    }

    pub const fn from_raw(raw: u64) -> Self {
        Pte(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub fn writable(self) -> bool {
        self.0 & PteFlags::WRITE.bits() != 0
    }

    pub fn dirty(self) -> bool {
        self.0 & PteFlags::DIRTY.bits() != 0
    }

    /// Kernel virtual address of the backing page.
    pub fn page_kva(self) -> u64 {
        self.0 & PAGE_MASK
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn mkwrite(self) -> Self {
        Pte(self.0 | PteFlags::WRITE.bits())
    }

    pub fn mkdirty(self) -> Self {
        Pte(self.0 | PteFlags::DIRTY.bits())
    }

    pub fn mkyoung(self) -> Self {
        Pte(self.0 | PteFlags::ACCESSED.bits())
    }
}

/// Leaf-level table: the entry array plus its split lock.
///
/// Entries are atomics so lockless readers (translation, re-check prologues)
/// see whole values; all stores happen under [`LeafTable::lock`].
pub struct LeafTable {
    lock: Mutex<()>,
    entries: [AtomicU64; PTRS_PER_TABLE],
}

impl LeafTable {
    fn new() -> Box<Self> {
        Box::new(LeafTable {
            lock: Mutex::new(()),
            entries: core::array::from_fn(|_| AtomicU64::new(0)),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn get(&self, index: usize) -> Pte {
        Pte(self.entries[index].load(Ordering::Acquire))
    }

    pub fn set(&self, index: usize, pte: Pte) {
        self.entries[index].store(pte.raw(), Ordering::Release);
    }
}

struct PmdTable {
    slots: [Once<Box<LeafTable>>; PTRS_PER_TABLE],
}

struct PudTable {
    slots: [Once<Box<PmdTable>>; PTRS_PER_TABLE],
}

struct PgdTable {
    slots: [Once<Box<PudTable>>; PTRS_PER_TABLE],
}

impl PmdTable {
    fn new() -> Box<Self> {
        Box::new(PmdTable {
            slots: core::array::from_fn(|_| Once::new()),
        })
    }
}

impl PudTable {
    fn new() -> Box<Self> {
        Box::new(PudTable {
            slots: core::array::from_fn(|_| Once::new()),
        })
    }
}

impl PgdTable {
    fn new() -> Box<Self> {
        Box::new(PgdTable {
            slots: core::array::from_fn(|_| Once::new()),
        })
    }
}

/// Per-address-space table hierarchy.
pub struct PageTable {
    pgd: Box<PgdTable>,
}

impl PageTable {
    pub fn new() -> Self {
        PageTable {
            pgd: PgdTable::new(),
        }
    }

    #[inline]
    fn pgd_index(va: u64) -> usize {
        ((va >> (PAGE_SHIFT + 3 * LEVEL_BITS)) & (PTRS_PER_TABLE as u64 - 1)) as usize
    }

    #[inline]
    fn pud_index(va: u64) -> usize {
        ((va >> (PAGE_SHIFT + 2 * LEVEL_BITS)) & (PTRS_PER_TABLE as u64 - 1)) as usize
    }

    #[inline]
    fn pmd_index(va: u64) -> usize {
        ((va >> (PAGE_SHIFT + LEVEL_BITS)) & (PTRS_PER_TABLE as u64 - 1)) as usize
    }

    /// Index of `va`'s entry within its leaf table.
    #[inline]
    pub fn pte_index(va: u64) -> usize {
        ((va >> PAGE_SHIFT) & (PTRS_PER_TABLE as u64 - 1)) as usize
    }

    /// Leaf table covering `va`, materializing missing directory levels.
    /// Directory growth is heap-backed and does not fail; only data pages
    /// can run the node out of memory.
    pub fn pte_alloc(&self, va: u64) -> &LeafTable {
        let pud = self.pgd.slots[Self::pgd_index(va)].call_once(PudTable::new);
        let pmd = pud.slots[Self::pud_index(va)].call_once(PmdTable::new);
        pmd.slots[Self::pmd_index(va)].call_once(LeafTable::new).as_ref()
    }

    /// Leaf table covering `va` if every directory level already exists.
    pub fn pte_walk(&self, va: u64) -> Option<&LeafTable> {
        let pud = self.pgd.slots[Self::pgd_index(va)].get()?;
        let pmd = pud.slots[Self::pud_index(va)].get()?;
        Some(pmd.slots[Self::pmd_index(va)].get()?.as_ref())
    }

    /// Resolve `va` to its leaf entry, if present.
    pub fn translate(&self, va: u64) -> Option<Pte> {
        let leaf = self.pte_walk(va)?;
        let pte = leaf.get(Self::pte_index(va));
        if pte.present() {
            Some(pte)
        } else {
            None
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    #[test]
    fn test_pte_bits() {
        let pte = Pte::new(0xffff_8800_0123_4000, PteFlags::PRESENT);
        assert!(pte.present());
        assert!(!pte.writable());
        assert!(!pte.dirty());
        assert_eq!(pte.page_kva(), 0xffff_8800_0123_4000);

        let rw = pte.mkwrite().mkdirty().mkyoung();
        assert!(rw.writable());
        assert!(rw.dirty());
        assert_eq!(rw.page_kva(), pte.page_kva());
    }

    #[test]
    fn test_walk_requires_population() {
        let pt = PageTable::new();
        assert!(pt.pte_walk(0x4000).is_none());
        assert!(pt.translate(0x4000).is_none());

        let leaf = pt.pte_alloc(0x4000);
        assert!(leaf.get(PageTable::pte_index(0x4000)).is_none());
        assert!(pt.pte_walk(0x4000).is_some());
        // Still nothing mapped until an entry is stored.
        assert!(pt.translate(0x4000).is_none());
    }

    #[test]
    fn test_translate_present_entry() {
        let pt = PageTable::new();
        let va = 0x7f00_2000u64;
        let leaf = pt.pte_alloc(va);
        leaf.set(
            PageTable::pte_index(va),
            Pte::new(0xffff_8800_0000_1000, PteFlags::PRESENT | PteFlags::WRITE),
        );

        let pte = pt.translate(va).unwrap();
        assert_eq!(pte.page_kva(), 0xffff_8800_0000_1000);
        assert!(pte.writable());
        // Neighboring pages share the leaf but stay unmapped.
        assert!(pt.translate(va + PAGE_SIZE).is_none());
    }

    #[test]
    fn test_distant_addresses_use_distinct_leaves() {
        let pt = PageTable::new();
        let a = pt.pte_alloc(0x1000) as *const LeafTable;
        let b = pt.pte_alloc(0x0000_4000_0000_1000) as *const LeafTable;
        assert_ne!(a, b);
        // Same 2MB window shares one leaf.
        let c = pt.pte_alloc(0x1000) as *const LeafTable;
        assert_eq!(a, c);
    }
}

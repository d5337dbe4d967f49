//! Memory management for remote address spaces.
//!
//! Each process served by a memory node owns one [`AddressSpace`]: the VMA
//! index and layout bookkeeping behind a read/write lock, plus the software
//! page table, which carries its own finer locking (per-leaf) and is walked
//! without the address-space lock.
//!
//! Lock order: address-space lock, then leaf page-table lock. Fault
//! resolution holds the read side across the walk; only mapping and stack
//! expansion take the write side.

pub mod fault;
pub mod pgtable;
pub mod tree;
pub mod uaccess;
pub mod vma;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};

use log::debug;
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{DEFAULT_STACK_RLIMIT, PAGE_MASK, PAGE_SHIFT, STACK_GUARD_GAP, TASK_SIZE_MAX};
use crate::error::{KernelError, KernelResult};
use crate::mm::fault::FileVmOps;
use crate::mm::pgtable::PageTable;
use crate::mm::tree::VmaTree;
use crate::mm::vma::{MappedFile, Vma, VM_GROWSDOWN, VM_WRITE};

/// Floor for automatic placement of new mappings.
pub const MMAP_BASE: u64 = 0x7f00_0000_0000;

/// Mutable layout state guarded by the address-space lock.
pub struct MmInner {
    vmas: VmaTree,
    pub map_count: u32,
    /// Mapped pages, total and by kind.
    pub total_vm: u64,
    pub data_vm: u64,
    pub stack_vm: u64,
    /// End of the highest mapping ever created.
    pub highest_vm_end: u64,
    pub start_code: u64,
    pub end_code: u64,
    pub start_data: u64,
    pub end_data: u64,
    pub start_brk: u64,
    pub brk: u64,
    pub start_stack: u64,
    mmap_base: u64,
}

impl MmInner {
    /// First region whose end lies above `addr`; containment is up to the
    /// caller, as unmapped holes below a region resolve to that region.
    pub fn find_vma(&self, addr: u64) -> Option<&Vma> {
        self.vmas.find(addr)
    }

    pub fn vmas(&self) -> &VmaTree {
        &self.vmas
    }
}

/// One remote process image.
pub struct AddressSpace {
    inner: RwLock<MmInner>,
    page_table: PageTable,
    mm_users: AtomicI32,
    mm_count: AtomicI32,
    /// Exclusive upper bound on user addresses.
    pub task_size: u64,
    /// Stack growth ceiling in bytes.
    pub stack_rlim: u64,
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace {
            inner: RwLock::new(MmInner {
                vmas: VmaTree::new(),
                map_count: 0,
                total_vm: 0,
                data_vm: 0,
                stack_vm: 0,
                highest_vm_end: 0,
                start_code: 0,
                end_code: 0,
                start_data: 0,
                end_data: 0,
                start_brk: 0,
                brk: 0,
                start_stack: 0,
                mmap_base: MMAP_BASE,
            }),
            page_table: PageTable::new(),
            mm_users: AtomicI32::new(1),
            mm_count: AtomicI32::new(1),
            task_size: TASK_SIZE_MAX,
            stack_rlim: DEFAULT_STACK_RLIMIT,
        }
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn mmap_read_lock(&self) -> RwLockReadGuard<'_, MmInner> {
        self.inner.read()
    }

    pub fn mmap_write_lock(&self) -> RwLockWriteGuard<'_, MmInner> {
        self.inner.write()
    }

    /// Map an anonymous region. `addr == 0` asks for automatic placement.
    pub fn map_anonymous(&self, addr: u64, len: u64, flags: u32) -> KernelResult<u64> {
        self.do_map(addr, len, |start, end| Ok(Vma::new(start, end, flags)))
    }

    /// Map `len` bytes of `file` starting at file page `pgoff`.
    pub fn map_file(
        &self,
        addr: u64,
        len: u64,
        flags: u32,
        file: Arc<MappedFile>,
        pgoff: u64,
    ) -> KernelResult<u64> {
        self.do_map(addr, len, |start, end| {
            Ok(Vma::new_file(start, end, flags, file, pgoff, Arc::new(FileVmOps)))
        })
    }

    fn do_map<F>(&self, addr: u64, len: u64, build: F) -> KernelResult<u64>
    where
        F: FnOnce(u64, u64) -> KernelResult<Vma>,
    {
        if len == 0 || len & !PAGE_MASK != 0 || addr & !PAGE_MASK != 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut inner = self.inner.write();
        let start = if addr == 0 {
            inner
                .vmas
                .unmapped_area(len, inner.mmap_base, self.task_size)
                .ok_or(KernelError::OutOfMemory)?
        } else {
            addr
        };
        let end = start.checked_add(len).ok_or(KernelError::InvalidArgument)?;
        if end > self.task_size {
            return Err(KernelError::InvalidArgument);
        }

        let vma = build(start, end)?;
        let flags = vma.flags;
        inner.vmas.insert(vma)?;

        inner.map_count += 1;
        let pages = len >> PAGE_SHIFT;
        vm_stat_account(&mut inner, flags, pages as i64);
        if end > inner.highest_vm_end {
            inner.highest_vm_end = end;
        }
        debug!("mm: mapped [{:#x}, {:#x}) flags {:#x}", start, end, flags);
        Ok(start)
    }

    /// Grow the grows-down region above `address` until it covers it.
    ///
    /// Refuses growth past the stack rlimit or into the guard gap above
    /// the next lower region.
    pub fn expand_stack(&self, address: u64) -> KernelResult<()> {
        let aligned = address & PAGE_MASK;
        let mut inner = self.inner.write();

        let idx = match inner.vmas.find_idx(address) {
            Some(idx) => idx,
            None => return Err(KernelError::BadAddress),
        };
        let (start, end, growsdown) = {
            let vma = inner.vmas.get(idx);
            (vma.start, vma.end, vma.is_growsdown())
        };
        if start <= address {
            // A concurrent expansion already covered it.
            return Ok(());
        }
        if !growsdown {
            return Err(KernelError::BadAddress);
        }
        if end - aligned > self.stack_rlim {
            return Err(KernelError::OutOfMemory);
        }
        let floor = inner.vmas.prev_end(idx);
        if floor != 0 && aligned < floor + STACK_GUARD_GAP {
            return Err(KernelError::OutOfMemory);
        }

        let grow_pages = (start - aligned) >> PAGE_SHIFT;
        inner.vmas.set_start(idx, aligned)?;
        inner.total_vm += grow_pages;
        inner.stack_vm += grow_pages;
        debug!("mm: stack grew to [{:#x}, {:#x})", aligned, end);
        Ok(())
    }

    pub fn mmget(&self) {
        self.mm_users.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one user reference. The image itself is reclaimed with the
    /// owning Arc; the counters only gate teardown ordering.
    pub fn mmput(&self) -> i32 {
        self.mm_users.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn mmgrab(&self) {
        self.mm_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mmdrop(&self) -> i32 {
        self.mm_count.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn vm_stat_account(inner: &mut MmInner, flags: u32, pages: i64) {
    let add = |counter: &mut u64, delta: i64| {
        *counter = if delta >= 0 {
            counter.saturating_add(delta as u64)
        } else {
            counter.saturating_sub((-delta) as u64)
        };
    };
    add(&mut inner.total_vm, pages);
    if flags & VM_GROWSDOWN != 0 {
        add(&mut inner.stack_vm, pages);
    } else if flags & VM_WRITE != 0 {
        add(&mut inner.data_vm, pages);
    }
}

//! Remote page-fault resolution.
//!
//! Faults arrive from processor nodes already resolved to a VMA by the
//! caller (which holds the address-space read lock). Classification walks
//! the leaf entry: never-populated entries zero-fill or read through the
//! region's fault capability, present entries only need write upgrades,
//! and the two states this node never produces (swapped-out entries,
//! write-protected shared pages) are fatal.
//!
//! Concurrent faults on one page are resolved by the leaf lock: whoever
//! installs first wins, and the loser frees its freshly built page and
//! returns success, ending up mapped to the winner's page.

use bitflags::bitflags;
use log::{debug, warn};

use crate::config::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::mm::pgtable::{LeafTable, PageTable, Pte};
use crate::mm::vma::{Vma, VmOperations, VM_WRITE};
use crate::services::FaultServices;
use crate::task::Task;

bitflags! {
    /// Fault qualifiers carried in miss requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        const WRITE = 1 << 0;
    }
}

/// Why a fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Page allocation failed.
    OutOfMemory,
    /// Backing store failed to deliver the page.
    SigBus,
    /// Access outside the process image.
    SigSegv,
}

/// In-flight fault context handed to region operations.
pub struct VmFault<'a> {
    pub task: &'a Task,
    /// Faulting address, page aligned.
    pub address: u64,
    /// File offset of the faulting page, in pages.
    pub pgoff: u64,
    pub flags: FaultFlags,
    /// Backing page produced by the operation.
    pub page_kva: u64,
}

/// Default fault capability for file-backed regions: allocate a page and
/// read it from storage. A short read leaves the tail zeroed.
pub struct FileVmOps;

impl VmOperations for FileVmOps {
    fn fault(
        &self,
        services: &FaultServices<'_>,
        vma: &Vma,
        vmf: &mut VmFault<'_>,
    ) -> Result<(), FaultError> {
        let file = match vma.file.as_ref() {
            Some(file) => file,
            None => return Err(FaultError::SigBus),
        };
        let kva = services
            .pages
            .alloc_page()
            .map_err(|_| FaultError::OutOfMemory)?;
        let pos = vmf.pgoff << PAGE_SHIFT;
        if let Err(err) = services
            .storage
            .read(vmf.task, file, kva, PAGE_SIZE as usize, pos)
        {
            warn!(
                "fault: storage read failed for {} at pgoff {}: {:?}",
                file.name, vmf.pgoff, err
            );
            services.pages.free_page(kva);
            return Err(FaultError::SigBus);
        }
        vmf.page_kva = kva;
        Ok(())
    }
}

/// Resolve one fault at `address` inside `vma`, returning the kernel
/// virtual address of the page mapped there afterwards. The caller holds
/// the address-space read lock.
pub fn handle_mm_fault(
    services: &FaultServices<'_>,
    task: &Task,
    pt: &PageTable,
    vma: &Vma,
    address: u64,
    flags: FaultFlags,
) -> Result<u64, FaultError> {
    let leaf = pt.pte_alloc(address);
    handle_pte_fault(services, task, leaf, vma, address, flags)?;
    Ok(leaf.get(PageTable::pte_index(address)).page_kva())
}

fn handle_pte_fault(
    services: &FaultServices<'_>,
    task: &Task,
    leaf: &LeafTable,
    vma: &Vma,
    address: u64,
    flags: FaultFlags,
) -> Result<(), FaultError> {
    let index = PageTable::pte_index(address);
    let entry = leaf.get(index);

    if !entry.present() {
        if entry.is_none() {
            return match vma.ops.as_ref() {
                Some(ops) => {
                    do_linear_fault(services, task, leaf, index, vma, ops.as_ref(), address, flags, entry)
                }
                None => do_anonymous_page(services, leaf, index, vma),
            };
        }
        return do_swap_page(entry);
    }

    // Present entry: another CPU beat us here, or this is a write upgrade.
    let _ptl = leaf.lock();
    let current = leaf.get(index);
    if current != entry {
        // Raced with a concurrent resolver; its installation stands.
        return Ok(());
    }
    if flags.contains(FaultFlags::WRITE) {
        if !current.writable() {
            return do_wp_page(current);
        }
        leaf.set(index, current.mkdirty().mkyoung());
    }
    Ok(())
}

/// Zero-fill fault. Writability comes from the region, not the access:
/// a read fault on a writable anonymous region still installs a writable
/// (and dirty) mapping so the processor side never traps again for writes.
fn do_anonymous_page(
    services: &FaultServices<'_>,
    leaf: &LeafTable,
    index: usize,
    vma: &Vma,
) -> Result<(), FaultError> {
    let kva = services
        .pages
        .alloc_page()
        .map_err(|_| FaultError::OutOfMemory)?;

    let mut entry = Pte::new(kva, vma.page_prot).mkyoung();
    if vma.flags & VM_WRITE != 0 {
        entry = entry.mkwrite().mkdirty();
    }

    let ptl = leaf.lock();
    if !leaf.get(index).is_none() {
        drop(ptl);
        // Lost the install race; the winner's mapping serves this fault.
        services.pages.free_page(kva);
        return Ok(());
    }
    leaf.set(index, entry);
    Ok(())
}

/// File-backed fault: ask the region's capability for the page, then
/// install it. The protection template already grants write access in
/// writable regions; the dirty bit is layered on only for write faults,
/// so a read-faulted file page stays clean until written.
fn do_linear_fault(
    services: &FaultServices<'_>,
    task: &Task,
    leaf: &LeafTable,
    index: usize,
    vma: &Vma,
    ops: &dyn VmOperations,
    address: u64,
    flags: FaultFlags,
    orig: Pte,
) -> Result<(), FaultError> {
    let mut vmf = VmFault {
        task,
        address: address & PAGE_MASK,
        pgoff: vma.linear_page_index(address),
        flags,
        page_kva: 0,
    };
    ops.fault(services, vma, &mut vmf)?;

    let ptl = leaf.lock();
    if leaf.get(index) != orig {
        drop(ptl);
        services.pages.free_page(vmf.page_kva);
        return Ok(());
    }
    let mut entry = Pte::new(vmf.page_kva, vma.page_prot).mkyoung();
    if flags.contains(FaultFlags::WRITE) && vma.flags & VM_WRITE != 0 {
        entry = entry.mkwrite().mkdirty();
    }
    leaf.set(index, entry);
    Ok(())
}

/// Memory nodes never write swap entries, so finding one means the table
/// was corrupted.
fn do_swap_page(entry: Pte) -> Result<(), FaultError> {
    panic!(
        "fault: swap-in hit a non-present entry {:#x}; no swap path exists",
        entry.raw()
    );
}

/// Writable regions install writable entries, so a read-only present
/// entry under a write fault means write access into a read-only region.
/// There is no copy-on-write to fall back on.
fn do_wp_page(entry: Pte) -> Result<(), FaultError> {
    panic!(
        "fault: write-protect fault on entry {:#x}; copy-on-write does not exist here",
        entry.raw()
    );
}

/// Bulk-populate `nr_pages` leaf entries around a file-backed miss with
/// one contiguous allocation and one storage read.
///
/// Entries that are already populated keep their page; the corresponding
/// chunk of the bulk block stays allocated, since the block can only be
/// freed whole. That loss is bounded by the window size and logged.
pub fn handle_mmap_prefetch(
    services: &FaultServices<'_>,
    task: &Task,
    pt: &PageTable,
    vma: &Vma,
    address: u64,
    nr_pages: u32,
) -> Result<(), FaultError> {
    let file = match vma.file.as_ref() {
        Some(file) => file,
        None => return Err(FaultError::SigBus),
    };
    let start = address & PAGE_MASK;
    let order = nr_pages.trailing_zeros();

    let bulk = services
        .pages
        .alloc_pages(order)
        .map_err(|_| FaultError::OutOfMemory)?;

    if count_empty_entries(pt, start, nr_pages) == 0 {
        services.pages.free_pages(bulk, order);
        return Ok(());
    }

    let pos = vma.linear_page_index(start) << PAGE_SHIFT;
    let count = nr_pages as usize * PAGE_SIZE as usize;
    if let Err(err) = services.storage.read(task, file, bulk, count, pos) {
        warn!(
            "fault: prefetch read failed for {} at {:#x}: {:?}",
            file.name, pos, err
        );
        services.pages.free_pages(bulk, order);
        return Err(FaultError::SigBus);
    }

    let mut cur_addr = start;
    let mut cur_page = bulk;
    for _ in 0..nr_pages {
        let leaf = pt.pte_alloc(cur_addr);
        let index = PageTable::pte_index(cur_addr);
        let orig = leaf.get(index);
        if !orig.is_none() {
            warn!(
                "fault: prefetch window {:#x} already populated, chunk {:#x} stays allocated",
                cur_addr, cur_page
            );
        } else {
            let ptl = leaf.lock();
            if leaf.get(index) == orig {
                let mut entry = Pte::new(cur_page, vma.page_prot).mkyoung();
                if vma.flags & VM_WRITE != 0 {
                    entry = entry.mkwrite().mkdirty();
                }
                leaf.set(index, entry);
            } else {
                debug!("fault: prefetch lost install race at {:#x}", cur_addr);
            }
            drop(ptl);
        }
        cur_addr += PAGE_SIZE;
        cur_page += PAGE_SIZE;
    }
    Ok(())
}

/// Count never-populated leaf entries in the `nr_pages` window at `address`,
/// materializing directory levels along the way.
pub fn count_empty_entries(pt: &PageTable, address: u64, nr_pages: u32) -> u32 {
    let mut empty = 0;
    let mut cur = address & PAGE_MASK;
    for _ in 0..nr_pages {
        let leaf = pt.pte_alloc(cur);
        if leaf.get(PageTable::pte_index(cur)).is_none() {
            empty += 1;
        }
        cur += PAGE_SIZE;
    }
    empty
}

//! Virtual memory areas.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use crate::config::PAGE_SHIFT;
use crate::mm::fault::{FaultError, VmFault};
use crate::mm::pgtable::PteFlags;
use crate::services::FaultServices;

// VMA flag bits - Linux VM_* values
pub const VM_NONE: u32 = 0x0000;
pub const VM_READ: u32 = 0x0001;
pub const VM_WRITE: u32 = 0x0002;
pub const VM_EXEC: u32 = 0x0004;
pub const VM_SHARED: u32 = 0x0008;
/// Region may extend downward when faults land below its start.
pub const VM_GROWSDOWN: u32 = 0x0100;

/// File identity as the storage service knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedFile {
    pub name: String,
}

impl MappedFile {
    pub fn new(name: &str) -> Self {
        MappedFile {
            name: String::from(name),
        }
    }
}

/// Per-region fault capability. File-backed regions carry one; anonymous
/// regions carry none and take the zero-fill path.
pub trait VmOperations: Send + Sync {
    /// Region attached to an address space.
    fn open(&self, _vma: &Vma) {}

    /// Region about to be detached.
    fn close(&self, _vma: &Vma) {}

    /// Produce the backing page for `vmf.address`, filling `vmf.page_kva`.
    fn fault(
        &self,
        services: &FaultServices<'_>,
        vma: &Vma,
        vmf: &mut VmFault<'_>,
    ) -> Result<(), FaultError>;
}

/// One mapped region `[start, end)` of a remote process image.
#[derive(Clone)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    /// VM_* bits.
    pub flags: u32,
    /// Protection template for newly installed leaf entries.
    pub page_prot: PteFlags,
    /// File offset of `start`, in pages.
    pub pgoff: u64,
    pub file: Option<Arc<MappedFile>>,
    pub ops: Option<Arc<dyn VmOperations>>,
}

impl Vma {
    /// Anonymous region.
    pub fn new(start: u64, end: u64, flags: u32) -> Self {
        Vma {
            start,
            end,
            flags,
            page_prot: vm_page_prot(flags),
            pgoff: 0,
            file: None,
            ops: None,
        }
    }

    /// File-backed region reading through `ops`.
    pub fn new_file(
        start: u64,
        end: u64,
        flags: u32,
        file: Arc<MappedFile>,
        pgoff: u64,
        ops: Arc<dyn VmOperations>,
    ) -> Self {
        Vma {
            start,
            end,
            flags,
            page_prot: vm_page_prot(flags),
            pgoff,
            file: Some(file),
            ops: Some(ops),
        }
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline]
    pub fn is_growsdown(&self) -> bool {
        self.flags & VM_GROWSDOWN != 0
    }

    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.ops.is_none()
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn pages(&self) -> u64 {
        self.len() >> PAGE_SHIFT
    }

    /// File offset of the page containing `addr`, in pages.
    #[inline]
    pub fn linear_page_index(&self, addr: u64) -> u64 {
        ((addr - self.start) >> PAGE_SHIFT) + self.pgoff
    }
}

impl fmt::Debug for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vma")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("pgoff", &self.pgoff)
            .field("file", &self.file)
            .finish()
    }
}

/// Leaf protection template for a VM_* word. Write access shows up in the
/// template only when the region itself is writable; fault handling layers
/// dirty/accessed bits on top.
pub fn vm_page_prot(flags: u32) -> PteFlags {
    let mut prot = PteFlags::PRESENT;
    if flags & VM_WRITE != 0 {
        prot |= PteFlags::WRITE;
    }
    prot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_prot_tracks_writability() {
        assert_eq!(vm_page_prot(VM_READ), PteFlags::PRESENT);
        assert_eq!(
            vm_page_prot(VM_READ | VM_WRITE),
            PteFlags::PRESENT | PteFlags::WRITE
        );
    }

    #[test]
    fn test_linear_page_index() {
        let mut vma = Vma::new(0x4000, 0x6000, VM_READ);
        vma.pgoff = 8;
        assert_eq!(vma.linear_page_index(0x4000), 8);
        assert_eq!(vma.linear_page_index(0x5010), 9);
    }

    #[test]
    fn test_contains() {
        let vma = Vma::new(0x1000, 0x2000, VM_READ | VM_WRITE);
        assert!(vma.contains(0x1000));
        assert!(vma.contains(0x1fff));
        assert!(!vma.contains(0x2000));
        assert!(!vma.contains(0xfff));
        assert_eq!(vma.pages(), 1);
    }
}

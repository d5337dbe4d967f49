//! Byte access into a remote process image.
//!
//! Copies walk the software page table directly and never fault pages in;
//! hitting an unmapped page stops the copy and reports how far it got.

use crate::config::PAGE_SIZE;
use crate::mm::pgtable::PageTable;
use crate::services::PageAllocator;

/// Copy `buf` into the process image at `user_va`. Returns bytes copied,
/// which is short when an unmapped page interrupts the range.
pub fn copy_to_user(pages: &dyn PageAllocator, pt: &PageTable, user_va: u64, buf: &[u8]) -> usize {
    let mut copied = 0usize;
    while copied < buf.len() {
        let va = user_va + copied as u64;
        let pte = match pt.translate(va) {
            Some(pte) => pte,
            None => break,
        };
        let offset = va & (PAGE_SIZE - 1);
        let room = (PAGE_SIZE - offset) as usize;
        let chunk = core::cmp::min(buf.len() - copied, room);
        if pages
            .write(pte.page_kva() + offset, &buf[copied..copied + chunk])
            .is_err()
        {
            break;
        }
        copied += chunk;
    }
    copied
}

/// Copy bytes out of the process image at `user_va` into `buf`. Returns
/// bytes copied.
pub fn copy_from_user(
    pages: &dyn PageAllocator,
    pt: &PageTable,
    user_va: u64,
    buf: &mut [u8],
) -> usize {
    let mut copied = 0usize;
    let len = buf.len();
    while copied < len {
        let va = user_va + copied as u64;
        let pte = match pt.translate(va) {
            Some(pte) => pte,
            None => break,
        };
        let offset = va & (PAGE_SIZE - 1);
        let room = (PAGE_SIZE - offset) as usize;
        let chunk = core::cmp::min(len - copied, room);
        if pages
            .read(pte.page_kva() + offset, &mut buf[copied..copied + chunk])
            .is_err()
        {
            break;
        }
        copied += chunk;
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::fault::{handle_mm_fault, FaultFlags};
    use crate::mm::vma::{Vma, VM_READ, VM_WRITE};
    use crate::services::FaultServices;
    use crate::task::Task;
    use crate::testutil::{MockPages, MockStorage};
    use alloc::sync::Arc;
    use alloc::vec;

    fn mapped_pages(pt: &PageTable, pages: &Arc<MockPages>, storage: &Arc<MockStorage>, vas: &[u64]) {
        let task = Task::new(1, 0, 0, "uaccess", None);
        let services = FaultServices {
            pages: &**pages,
            storage: &**storage,
        };
        let vma = Vma::new(0x1000, 0x10000, VM_READ | VM_WRITE);
        for &va in vas {
            handle_mm_fault(&services, &task, pt, &vma, va, FaultFlags::WRITE).unwrap();
        }
    }

    #[test]
    fn test_copy_roundtrip_across_pages() {
        let pages = Arc::new(MockPages::new());
        let storage = Arc::new(MockStorage::new(pages.clone()));
        let pt = PageTable::new();
        mapped_pages(&pt, &pages, &storage, &[0x1000, 0x2000]);

        // Straddle the 0x1000/0x2000 boundary.
        let data: Vec<u8> = (0..64u32).map(|i| i as u8).collect();
        let wrote = copy_to_user(&*pages, &pt, 0x1fe0, &data);
        assert_eq!(wrote, 64);

        let mut back = vec![0u8; 64];
        let read = copy_from_user(&*pages, &pt, 0x1fe0, &mut back);
        assert_eq!(read, 64);
        assert_eq!(back, data);
    }

    #[test]
    fn test_copy_stops_at_unmapped_page() {
        let pages = Arc::new(MockPages::new());
        let storage = Arc::new(MockStorage::new(pages.clone()));
        let pt = PageTable::new();
        mapped_pages(&pt, &pages, &storage, &[0x1000]);

        let data = vec![0xabu8; 100];
        // 0x2000 is unmapped; the copy covers only the mapped tail bytes.
        let wrote = copy_to_user(&*pages, &pt, 0x1fc0, &data);
        assert_eq!(wrote, 64);

        let mut back = vec![0u8; 100];
        let read = copy_from_user(&*pages, &pt, 0x1fc0, &mut back);
        assert_eq!(read, 64);
        assert_eq!(&back[..64], &data[..64]);

        // Entirely unmapped start copies nothing.
        assert_eq!(copy_to_user(&*pages, &pt, 0x8000, &data), 0);
    }
}

//! Seams toward hardware and off-node services.
//!
//! The scheduler and the memory node never touch real hardware directly;
//! everything below this line is a trait object supplied by the host
//! platform. Tests substitute in-memory fakes for all four.

use crate::error::KernelResult;
use crate::mm::vma::MappedFile;
use crate::mm::AddressSpace;
use crate::task::Task;

/// Opaque reply-routing token carried alongside each inbound request and
/// passed back verbatim when the answer is sent.
pub type ReplyDescriptor = u64;

/// Page-frame supplier for the memory node.
///
/// Addresses are kernel virtual addresses of page-aligned frames. Frames
/// come back zeroed.
pub trait PageAllocator: Send + Sync {
    /// Allocate one zeroed page, returning its kernel virtual address.
    fn alloc_page(&self) -> KernelResult<u64>;

    /// Allocate `1 << order` physically contiguous zeroed pages.
    fn alloc_pages(&self, order: u32) -> KernelResult<u64>;

    fn free_page(&self, kva: u64);

    fn free_pages(&self, kva: u64, order: u32);

    /// Copy bytes into page memory at `kva`.
    fn write(&self, kva: u64, bytes: &[u8]) -> KernelResult<()>;

    /// Copy bytes out of page memory at `kva` into `buf`.
    fn read(&self, kva: u64, buf: &mut [u8]) -> KernelResult<()>;
}

/// Backing-store reads for file-mapped regions.
pub trait StorageService: Send + Sync {
    /// Read up to `count` bytes of `file` starting at byte offset `pos`
    /// into page memory at `dst_kva`. A short read is not an error; the
    /// caller sees how many bytes actually arrived.
    fn read(
        &self,
        task: &Task,
        file: &MappedFile,
        dst_kva: u64,
        count: usize,
        pos: u64,
    ) -> KernelResult<usize>;
}

/// Reply path back to the requesting node.
pub trait Transport: Send + Sync {
    /// Send `payload` along the route identified by `desc`.
    fn reply(&self, desc: ReplyDescriptor, payload: &[u8]);
}

/// Hardware surface the scheduler drives.
pub trait SchedArch: Send + Sync {
    /// Monotonic nanosecond clock.
    fn sched_clock(&self) -> u64;

    /// Kick `cpu` so it passes through a scheduling point soon.
    fn send_reschedule(&self, cpu: u32);

    /// Activate `next`'s address space. Kernel threads pass None and keep
    /// whatever was live.
    fn switch_mm(&self, prev: Option<&AddressSpace>, next: Option<&AddressSpace>);

    /// Swap register and stack state between the outgoing and incoming task.
    fn switch_to(&self, prev: &Task, next: &Task);

    /// Pause hint used inside spin-waits once the quick-spin budget runs out.
    fn cpu_relax(&self);
}

/// Allocator and storage bundle threaded through fault resolution.
pub struct FaultServices<'a> {
    pub pages: &'a dyn PageAllocator,
    pub storage: &'a dyn StorageService,
}

//! In-memory fakes behind the service traits.
//!
//! A manually advanced clock, a page-frame map keyed by fake kernel
//! virtual address, a byte-array file store and a reply recorder. The
//! fakes keep the failure surface of the real services so error paths
//! stay reachable from tests.

use crate::config::{PAGE_MASK, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::vma::MappedFile;
use crate::mm::AddressSpace;
use crate::services::{PageAllocator, ReplyDescriptor, SchedArch, StorageService, Transport};
use crate::task::Task;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use spin::Mutex;

/// Manually advanced clock with no-op CPU hooks.
pub struct MockArch {
    now: AtomicU64,
}

impl MockArch {
    pub fn new() -> Self {
        MockArch {
            now: AtomicU64::new(0),
        }
    }

    /// Move the clock forward by `ns` nanoseconds.
    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::Relaxed);
    }
}

impl SchedArch for MockArch {
    fn sched_clock(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn send_reschedule(&self, _cpu: u32) {}

    fn switch_mm(&self, _prev: Option<&AddressSpace>, _next: Option<&AddressSpace>) {}

    fn switch_to(&self, _prev: &Task, _next: &Task) {}

    fn cpu_relax(&self) {
        std::thread::yield_now();
    }
}

const MOCK_KVA_BASE: u64 = 0xffff_8800_0000_0000;

/// Page-frame supplier backed by a map of byte arrays.
///
/// Frames live at fake kernel virtual addresses counting up from a
/// high-half base. The allocation budget makes exhaustion reproducible:
/// negative means unlimited, otherwise each allocation call spends one
/// unit and a spent budget fails with `OutOfMemory`.
pub struct MockPages {
    frames: Mutex<BTreeMap<u64, Vec<u8>>>,
    next_kva: AtomicU64,
    budget: AtomicI64,
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl MockPages {
    pub fn new() -> Self {
        MockPages {
            frames: Mutex::new(BTreeMap::new()),
            next_kva: AtomicU64::new(MOCK_KVA_BASE),
            budget: AtomicI64::new(-1),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        }
    }

    /// Let `n` more allocation calls succeed, then fail the rest.
    pub fn fail_after(&self, n: i64) {
        self.budget.store(n, Ordering::Relaxed);
    }

    /// Frames currently resident.
    pub fn live(&self) -> usize {
        self.frames.lock().len()
    }

    /// Pages handed out since construction.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Pages given back since construction.
    pub fn freed(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }

    fn take_budget(&self) -> bool {
        loop {
            let cur = self.budget.load(Ordering::Relaxed);
            if cur < 0 {
                return true;
            }
            if cur == 0 {
                return false;
            }
            if self
                .budget
                .compare_exchange(cur, cur - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }
}

impl PageAllocator for MockPages {
    fn alloc_page(&self) -> KernelResult<u64> {
        self.alloc_pages(0)
    }

    fn alloc_pages(&self, order: u32) -> KernelResult<u64> {
        if !self.take_budget() {
            return Err(KernelError::OutOfMemory);
        }
        let count = 1u64 << order;
        let base = self.next_kva.fetch_add(count * PAGE_SIZE, Ordering::Relaxed);
        let mut frames = self.frames.lock();
        for i in 0..count {
            frames.insert(base + i * PAGE_SIZE, vec![0u8; PAGE_SIZE as usize]);
        }
        self.allocated.fetch_add(count, Ordering::Relaxed);
        Ok(base)
    }

    fn free_page(&self, kva: u64) {
        let prev = self.frames.lock().remove(&kva);
        assert!(prev.is_some(), "free of unallocated frame {:#x}", kva);
        self.freed.fetch_add(1, Ordering::Relaxed);
    }

    fn free_pages(&self, kva: u64, order: u32) {
        for i in 0..(1u64 << order) {
            self.free_page(kva + i * PAGE_SIZE);
        }
    }

    fn write(&self, kva: u64, bytes: &[u8]) -> KernelResult<()> {
        let mut frames = self.frames.lock();
        let mut done = 0usize;
        while done < bytes.len() {
            let cur = kva + done as u64;
            let base = cur & PAGE_MASK;
            let offset = (cur - base) as usize;
            let chunk = core::cmp::min(bytes.len() - done, PAGE_SIZE as usize - offset);
            let frame = frames.get_mut(&base).ok_or(KernelError::BadAddress)?;
            frame[offset..offset + chunk].copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn read(&self, kva: u64, buf: &mut [u8]) -> KernelResult<()> {
        let frames = self.frames.lock();
        let mut done = 0usize;
        while done < buf.len() {
            let cur = kva + done as u64;
            let base = cur & PAGE_MASK;
            let offset = (cur - base) as usize;
            let chunk = core::cmp::min(buf.len() - done, PAGE_SIZE as usize - offset);
            let frame = frames.get(&base).ok_or(KernelError::BadAddress)?;
            buf[done..done + chunk].copy_from_slice(&frame[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }
}

/// Byte-array file store that fills page frames on demand.
pub struct MockStorage {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    pages: Arc<MockPages>,
}

impl MockStorage {
    pub fn new(pages: Arc<MockPages>) -> Self {
        MockStorage {
            files: Mutex::new(BTreeMap::new()),
            pages,
        }
    }

    pub fn put_file(&self, name: &str, content: Vec<u8>) {
        self.files.lock().insert(String::from(name), content);
    }
}

impl StorageService for MockStorage {
    fn read(
        &self,
        _task: &Task,
        file: &MappedFile,
        dst_kva: u64,
        count: usize,
        pos: u64,
    ) -> KernelResult<usize> {
        let files = self.files.lock();
        let data = match files.get(&file.name) {
            Some(data) => data,
            None => return Ok(0),
        };
        let pos = pos as usize;
        if pos >= data.len() {
            return Ok(0);
        }
        let n = core::cmp::min(count, data.len() - pos);
        self.pages.write(dst_kva, &data[pos..pos + n])?;
        Ok(n)
    }
}

/// Reply recorder standing in for the wire.
pub struct MockTransport {
    replies: Mutex<Vec<(ReplyDescriptor, Vec<u8>)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            replies: Mutex::new(Vec::new()),
        }
    }

    /// Payload of the most recent reply.
    pub fn last_reply(&self) -> Vec<u8> {
        let replies = self.replies.lock();
        match replies.last() {
            Some((_, payload)) => payload.clone(),
            None => panic!("no reply was sent"),
        }
    }
}

impl Transport for MockTransport {
    fn reply(&self, desc: ReplyDescriptor, payload: &[u8]) {
        self.replies.lock().push((desc, payload.to_vec()));
    }
}

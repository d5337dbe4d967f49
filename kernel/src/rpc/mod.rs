//! Memory-node request handling.
//!
//! One [`MemoryNode`] serves the page images of processes whose threads
//! run on other nodes. Compute nodes send cache-miss and writeback
//! requests over the transport; every request gets exactly one reply on
//! its descriptor. Miss replies are line data on success and a 4-byte
//! status otherwise; flush replies are always a 4-byte negated errno.

pub mod message;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;

use log::{debug, warn};
use spin::Mutex;

use crate::config::{MemConfig, CACHELINE_SIZE, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::fault::{handle_mm_fault, handle_mmap_prefetch, FaultError, FaultFlags};
use crate::mm::uaccess::copy_to_user;
use crate::mm::AddressSpace;
use crate::rpc::message::{
    status_reply, FlushRequest, LlcMissRequest, MessageHeader, P2M_LLC_MISS, P2M_PCACHE_FLUSH,
    RET_EFAULT, RET_ENOMEM, RET_ESIGSEGV, RET_ESRCH,
};
use crate::services::{PageAllocator, ReplyDescriptor, StorageService, Transport};
use crate::task::{Pid, Task};

fn fault_status(err: FaultError) -> i32 {
    match err {
        FaultError::OutOfMemory => RET_ENOMEM,
        FaultError::SigBus | FaultError::SigSegv => RET_ESIGSEGV,
    }
}

/// Remote-memory service for one node.
pub struct MemoryNode {
    /// Served processes, keyed by owning node and pid.
    tasks: Mutex<BTreeMap<(u32, Pid), Arc<Task>>>,
    pages: Arc<dyn PageAllocator>,
    storage: Arc<dyn StorageService>,
    transport: Arc<dyn Transport>,
    config: MemConfig,
}

impl MemoryNode {
    pub fn new(
        pages: Arc<dyn PageAllocator>,
        storage: Arc<dyn StorageService>,
        transport: Arc<dyn Transport>,
        config: MemConfig,
    ) -> KernelResult<Self> {
        config.validate()?;
        Ok(MemoryNode {
            tasks: Mutex::new(BTreeMap::new()),
            pages,
            storage,
            transport,
            config,
        })
    }

    pub fn config(&self) -> &MemConfig {
        &self.config
    }

    /// Start serving `task` for requests from `nid`.
    pub fn register_task(&self, nid: u32, task: Arc<Task>) -> KernelResult<()> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&(nid, task.pid)) {
            return Err(KernelError::AlreadyExists);
        }
        debug!("mm: serving pid {} for node {}", task.pid, nid);
        tasks.insert((nid, task.pid), task);
        Ok(())
    }

    pub fn unregister_task(&self, nid: u32, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().remove(&(nid, pid))
    }

    pub fn find_task(&self, nid: u32, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().get(&(nid, pid)).cloned()
    }

    /// Route one decoded request. Every request is answered, unknown
    /// opcodes included; the requester blocks on its descriptor.
    pub fn dispatch(&self, hdr: &MessageHeader, payload: &[u8], desc: ReplyDescriptor) {
        match hdr.opcode {
            P2M_LLC_MISS => self.handle_llc_miss(hdr, payload, desc),
            P2M_PCACHE_FLUSH => self.handle_flush(hdr, payload, desc),
            other => {
                warn!("rpc: unknown opcode {:#x} from node {}", other, hdr.src_nid);
                self.transport.reply(
                    desc,
                    &status_reply(KernelError::InvalidArgument.to_errno_neg()),
                );
            }
        }
    }

    /// Cache miss: resolve the faulting address to a page of the process
    /// image, materializing it on first touch, and return the requested
    /// window of it.
    fn handle_llc_miss(&self, hdr: &MessageHeader, payload: &[u8], desc: ReplyDescriptor) {
        let req = match LlcMissRequest::from_bytes(payload) {
            Ok(req) => req,
            Err(_) => {
                warn!("fault: malformed miss request from node {}", hdr.src_nid);
                self.transport.reply(desc, &status_reply(RET_EFAULT));
                return;
            }
        };
        debug!(
            "fault: miss nid {} pid {} vaddr {:#x} flags {:#x}",
            hdr.src_nid, req.pid, req.missing_vaddr, req.flags
        );

        let task = match self.find_task(hdr.src_nid, req.pid as Pid) {
            Some(task) => task,
            None => {
                warn!("fault: no task {} for node {}", req.pid, hdr.src_nid);
                self.transport.reply(desc, &status_reply(RET_ESRCH));
                return;
            }
        };
        let mm = match task.mm.as_ref() {
            Some(mm) => mm,
            None => {
                warn!("fault: task {} has no address space", req.pid);
                self.transport.reply(desc, &status_reply(RET_ESRCH));
                return;
            }
        };

        if req.missing_vaddr >= mm.task_size {
            self.transport.reply(desc, &status_reply(RET_EFAULT));
            return;
        }
        let fill = self.config.fill_len();
        if req.offset > PAGE_SIZE - fill as u64 {
            self.transport.reply(desc, &status_reply(RET_EFAULT));
            return;
        }

        match self.fault_in(&task, mm, &req) {
            Ok(page_kva) => {
                let mut line = vec![0u8; fill];
                if self.pages.read(page_kva + req.offset, &mut line).is_err() {
                    warn!("fault: page read failed at {:#x}", page_kva + req.offset);
                    self.transport.reply(desc, &status_reply(RET_EFAULT));
                    return;
                }
                self.transport.reply(desc, &line);
            }
            Err(err) => {
                warn!(
                    "fault: nid {} pid {} vaddr {:#x} not served: {:?}",
                    hdr.src_nid, req.pid, req.missing_vaddr, err
                );
                self.transport.reply(desc, &status_reply(fault_status(err)));
            }
        }
    }

    /// Walk the region tree for the faulting address and install its
    /// page, growing a stack region over the hole when one sits above.
    fn fault_in(
        &self,
        task: &Task,
        mm: &AddressSpace,
        req: &LlcMissRequest,
    ) -> Result<u64, FaultError> {
        let services = crate::services::FaultServices {
            pages: self.pages.as_ref(),
            storage: self.storage.as_ref(),
        };
        let flags = FaultFlags::from_bits_truncate(req.flags);
        let pt = mm.page_table();
        let vaddr = req.missing_vaddr;

        loop {
            {
                let inner = mm.mmap_read_lock();
                let vma = match inner.find_vma(vaddr) {
                    Some(vma) => vma,
                    None => return Err(FaultError::SigSegv),
                };
                if vma.start <= vaddr {
                    if vma.file.is_some() && self.config.prefetch_pages > 0 {
                        // Prefetch misses fall back to the single page.
                        if let Err(err) = handle_mmap_prefetch(
                            &services,
                            task,
                            pt,
                            vma,
                            vaddr,
                            self.config.prefetch_pages,
                        ) {
                            debug!("fault: prefetch near {:#x} skipped: {:?}", vaddr, err);
                        }
                    }
                    return handle_mm_fault(&services, task, pt, vma, vaddr, flags);
                }
                if !vma.is_growsdown() {
                    return Err(FaultError::SigSegv);
                }
            }
            // Hole below a stack region: grow it and fault again.
            if mm.expand_stack(vaddr).is_err() {
                return Err(FaultError::SigSegv);
            }
        }
    }

    /// Dirty-line writeback into the process image.
    fn handle_flush(&self, hdr: &MessageHeader, payload: &[u8], desc: ReplyDescriptor) {
        let req = match FlushRequest::from_bytes(payload) {
            Ok(req) => req,
            Err(err) => {
                warn!("pcache: malformed flush request from node {}", hdr.src_nid);
                self.transport.reply(desc, &status_reply(err.to_errno_neg()));
                return;
            }
        };
        if req.user_va & (CACHELINE_SIZE - 1) != 0 {
            self.transport.reply(
                desc,
                &status_reply(KernelError::InvalidArgument.to_errno_neg()),
            );
            return;
        }

        let task = match self.find_task(hdr.src_nid, req.pid as Pid) {
            Some(task) => task,
            None => {
                warn!("pcache: flush for unknown pid {} from node {}", req.pid, hdr.src_nid);
                self.transport.reply(
                    desc,
                    &status_reply(KernelError::NoProcess.to_errno_neg()),
                );
                return;
            }
        };
        let mm = match task.mm.as_ref() {
            Some(mm) => mm,
            None => {
                self.transport.reply(
                    desc,
                    &status_reply(KernelError::NoProcess.to_errno_neg()),
                );
                return;
            }
        };

        // A flush targets a line the processor faulted in earlier, so the
        // mapping must already exist; anything else is a protocol error.
        let copied = copy_to_user(self.pages.as_ref(), mm.page_table(), req.user_va, req.line);
        if copied != req.line.len() {
            warn!(
                "pcache: flush pid {} va {:#x} hit unmapped memory",
                req.pid, req.user_va
            );
            self.transport.reply(
                desc,
                &status_reply(KernelError::BadAddress.to_errno_neg()),
            );
            return;
        }
        debug!("pcache: line pid {} va {:#x} written back", req.pid, req.user_va);
        self.transport.reply(desc, &status_reply(0));
    }
}

//! Task records shared by the scheduler and the memory node.
//!
//! Hot state lives in atomics so wakeup and queue paths read it without
//! the run-queue lock; everything the scheduler mutates while holding a
//! run-queue lock sits behind the per-task sched lock. Lock order is
//! pi lock, then run-queue lock, then sched lock.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::config::RR_TIMESLICE;
use crate::cpumask::{CpuMask, CPU_MASK_ALL};
use crate::mm::AddressSpace;
use crate::sched::class::ClassId;

pub type Pid = u64;

pub const TASK_COMM_LEN: usize = 16;

// Task states - mask values so wakeups can match several at once
pub const TASK_RUNNING: u32 = 0x0000;
pub const TASK_INTERRUPTIBLE: u32 = 0x0001;
pub const TASK_UNINTERRUPTIBLE: u32 = 0x0002;
pub const TASK_DEAD: u32 = 0x0040;
pub const TASK_WAKING: u32 = 0x0100;
pub const TASK_NEW: u32 = 0x0800;
/// Sleep states a plain wakeup targets.
pub const TASK_NORMAL: u32 = TASK_INTERRUPTIBLE | TASK_UNINTERRUPTIBLE;

// Per-task flag bits
/// Per-CPU idle task.
pub const PF_IDLE: u32 = 0x0000_0002;
/// Per-CPU stop-work runner; outranks every scheduling class.
pub const PF_STOPPER: u32 = 0x0010_0000;
/// Affinity is pinned; checked affinity changes are refused.
pub const PF_NO_SETAFFINITY: u32 = 0x0400_0000;

// Where a task stands relative to run queues
pub const TASK_ON_RQ_QUEUED: u32 = 1;
pub const TASK_ON_RQ_MIGRATING: u32 = 2;

// Scheduling policies
pub const SCHED_NORMAL: i32 = 0;
pub const SCHED_FIFO: i32 = 1;
pub const SCHED_RR: i32 = 2;
pub const SCHED_BATCH: i32 = 3;
pub const SCHED_IDLE: i32 = 5;
/// Policy modifier: children revert to SCHED_NORMAL at default priority.
pub const SCHED_RESET_ON_FORK: i32 = 0x4000_0000;

// Effective priority space: 0..99 realtime, 100..139 nice levels
pub const MAX_RT_PRIO: i32 = 100;
pub const MAX_PRIO: i32 = MAX_RT_PRIO + 40;
pub const DEFAULT_PRIO: i32 = MAX_RT_PRIO + 20;

#[inline]
pub fn nice_to_prio(nice: i32) -> i32 {
    DEFAULT_PRIO + nice
}

#[inline]
pub fn prio_to_nice(prio: i32) -> i32 {
    prio - DEFAULT_PRIO
}

#[inline]
pub fn rt_prio(prio: i32) -> bool {
    prio < MAX_RT_PRIO
}

#[inline]
pub fn rt_policy(policy: i32) -> bool {
    policy == SCHED_FIFO || policy == SCHED_RR
}

#[inline]
pub fn idle_policy(policy: i32) -> bool {
    policy == SCHED_IDLE
}

#[inline]
pub fn valid_policy(policy: i32) -> bool {
    matches!(
        policy,
        SCHED_NORMAL | SCHED_FIFO | SCHED_RR | SCHED_BATCH | SCHED_IDLE
    )
}

/// Realtime priority request, 1..=99 for realtime policies.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedParam {
    pub sched_priority: i32,
}

/// Fair-class accounting for one task.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedEntity {
    /// Queue membership from the class's point of view; survives the
    /// save/restore dance around priority changes.
    pub on_rq: bool,
    pub exec_start: u64,
    pub sum_exec_runtime: u64,
    pub prev_sum_exec_runtime: u64,
    pub vruntime: u64,
    pub load_weight: u64,
    pub load_inv_weight: u32,
}

/// Round-robin slice state.
#[derive(Debug, Clone, Copy)]
pub struct RtEntity {
    /// Remaining ticks of the current slice.
    pub time_slice: u32,
    /// Expired slice: requeue behind equals instead of ahead of them.
    pub requeue_tail: bool,
}

impl Default for RtEntity {
    fn default() -> Self {
        RtEntity {
            time_slice: RR_TIMESLICE,
            requeue_tail: false,
        }
    }
}

/// Scheduling fields guarded by the per-task sched lock.
#[derive(Debug, Clone)]
pub struct SchedInfo {
    pub policy: i32,
    /// Effective priority, the only one queues are ordered by.
    pub prio: i32,
    /// Nice-derived priority, stable across policy games.
    pub static_prio: i32,
    /// Priority the task would have without temporary boosts.
    pub normal_prio: i32,
    /// Realtime priority in request form (1..=99, 0 for normal policies).
    pub rt_priority: u32,
    pub class: ClassId,
    pub cpus_allowed: CpuMask,
    pub nr_cpus_allowed: u32,
    pub reset_on_fork: bool,
    pub se: SchedEntity,
    pub rt: RtEntity,
}

impl Default for SchedInfo {
    fn default() -> Self {
        SchedInfo {
            policy: SCHED_NORMAL,
            prio: DEFAULT_PRIO,
            static_prio: DEFAULT_PRIO,
            normal_prio: DEFAULT_PRIO,
            rt_priority: 0,
            class: ClassId::Fair,
            cpus_allowed: CPU_MASK_ALL,
            nr_cpus_allowed: crate::config::MAX_CPUS as u32,
            reset_on_fork: false,
            se: SchedEntity::default(),
            rt: RtEntity::default(),
        }
    }
}

pub struct Task {
    pub pid: Pid,
    pub ppid: Pid,
    /// Owning processor node; 0 for node-local tasks.
    pub nid: u32,
    comm: Mutex<[u8; TASK_COMM_LEN]>,
    pub state: AtomicU32,
    pub flags: AtomicU32,
    /// CPU whose run queue owns this task.
    pub cpu: AtomicU32,
    /// CPU chosen at wakeup, before the queue move lands.
    pub wake_cpu: AtomicU32,
    /// Still executing on its CPU (descheduling not finished).
    pub on_cpu: AtomicBool,
    pub on_rq: AtomicU32,
    need_resched: AtomicBool,
    /// Set while an uninterruptible sleeper is off the queue, so the
    /// wakeup that requeues it can reverse the bookkeeping exactly once.
    contributes_to_load: AtomicBool,
    /// Wakeup/affinity serialization; taken before any run-queue lock.
    pub pi_lock: Mutex<()>,
    pub sched: Mutex<SchedInfo>,
    pub mm: Option<Arc<AddressSpace>>,
}

impl Task {
    pub fn new(pid: Pid, ppid: Pid, nid: u32, comm: &str, mm: Option<Arc<AddressSpace>>) -> Self {
        let task = Task {
            pid,
            ppid,
            nid,
            comm: Mutex::new([0; TASK_COMM_LEN]),
            state: AtomicU32::new(TASK_NEW),
            flags: AtomicU32::new(0),
            cpu: AtomicU32::new(0),
            wake_cpu: AtomicU32::new(0),
            on_cpu: AtomicBool::new(false),
            on_rq: AtomicU32::new(0),
            need_resched: AtomicBool::new(false),
            contributes_to_load: AtomicBool::new(false),
            pi_lock: Mutex::new(()),
            sched: Mutex::new(SchedInfo::default()),
            mm,
        };
        task.set_comm(comm);
        task
    }

    pub fn set_comm(&self, comm: &str) {
        let mut buf = self.comm.lock();
        *buf = [0; TASK_COMM_LEN];
        let bytes = comm.as_bytes();
        let len = core::cmp::min(bytes.len(), TASK_COMM_LEN - 1);
        buf[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn comm(&self) -> String {
        let buf = self.comm.lock();
        let len = buf.iter().position(|&b| b == 0).unwrap_or(TASK_COMM_LEN);
        String::from_utf8_lossy(&buf[..len]).into_owned()
    }

    #[inline]
    pub fn task_state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_state(&self, state: u32) {
        self.state.store(state, Ordering::Release);
    }

    #[inline]
    pub fn task_flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.task_flags() & PF_IDLE != 0
    }

    #[inline]
    pub fn is_stopper(&self) -> bool {
        self.task_flags() & PF_STOPPER != 0
    }

    #[inline]
    pub fn on_rq_queued(&self) -> bool {
        self.on_rq.load(Ordering::Acquire) == TASK_ON_RQ_QUEUED
    }

    #[inline]
    pub fn on_rq_migrating(&self) -> bool {
        self.on_rq.load(Ordering::Acquire) == TASK_ON_RQ_MIGRATING
    }

    #[inline]
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    /// Mark for reschedule; reports whether the mark was already set.
    #[inline]
    pub(crate) fn set_need_resched(&self) -> bool {
        self.need_resched.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn clear_need_resched(&self) {
        self.need_resched.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_contributes_to_load(&self, value: bool) {
        self.contributes_to_load.store(value, Ordering::Release);
    }

    /// Consume the load-contribution mark, if set.
    #[inline]
    pub(crate) fn take_contributes_to_load(&self) -> bool {
        self.contributes_to_load.swap(false, Ordering::AcqRel)
    }
}

//! Scheduling-class dispatch.
//!
//! Classes rank realtime above fair above idle; pick falls through that
//! order. The per-CPU stopper task sits outside the ranking entirely:
//! it owns no queue and preempts everything when stop work is pending.
//!
//! Every hook runs under the run-queue lock. Pick removes the chosen
//! entity from its queue and put_prev reinserts a still-runnable one, in
//! both queue-bearing classes, so "on the queue" always means "runnable
//! but not running".

use alloc::sync::Arc;

use crate::cpumask::{cpumask_weight, CpuMask};
use crate::sched::fair::FairClass;
use crate::sched::idle::IdleClass;
use crate::sched::rt::RtClass;
use crate::sched::{RqInner, SchedCore};
use crate::task::{rt_prio, Task};

// enqueue flags
pub const ENQUEUE_WAKEUP: u32 = 0x01;
pub const ENQUEUE_RESTORE: u32 = 0x02;
pub const ENQUEUE_HEAD: u32 = 0x10;

// dequeue flags
pub const DEQUEUE_SLEEP: u32 = 0x01;
pub const DEQUEUE_SAVE: u32 = 0x02;

// wakeup flags
pub const WF_SYNC: u32 = 0x01;
pub const WF_FORK: u32 = 0x02;

/// Class tags in ranking order; a numerically lower tag preempts a higher
/// one on sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClassId {
    RealTime = 0,
    Fair = 1,
    Idle = 2,
}

static FAIR_CLASS: FairClass = FairClass;
static RT_CLASS: RtClass = RtClass;
static IDLE_CLASS: IdleClass = IdleClass;

impl ClassId {
    /// Pick fall-through order.
    pub const RANKED: [ClassId; 3] = [ClassId::RealTime, ClassId::Fair, ClassId::Idle];

    pub fn ops(self) -> &'static dyn SchedClass {
        match self {
            ClassId::RealTime => &RT_CLASS,
            ClassId::Fair => &FAIR_CLASS,
            ClassId::Idle => &IDLE_CLASS,
        }
    }

    /// Class an effective priority dispatches to. The idle class is never
    /// chosen this way; only per-CPU idle tasks belong to it.
    pub fn for_prio(prio: i32) -> ClassId {
        if rt_prio(prio) {
            ClassId::RealTime
        } else {
            ClassId::Fair
        }
    }
}

pub trait SchedClass: Send + Sync {
    fn enqueue_task(&self, rq: &mut RqInner, p: &Arc<Task>, flags: u32);

    fn dequeue_task(&self, rq: &mut RqInner, p: &Arc<Task>, flags: u32);

    /// Choose and remove the next task of this class, or None to fall
    /// through to the next class.
    fn pick_next_task(&self, rq: &mut RqInner) -> Option<Arc<Task>>;

    /// Reinsert a descheduled task among the class's runnable entities.
    fn put_prev_task(&self, rq: &mut RqInner, prev: &Arc<Task>);

    /// Re-establish the running task as this class's current entity after
    /// it changed identity (policy, priority, affinity requeue).
    fn set_curr_task(&self, rq: &mut RqInner);

    /// Should the waking task `p` preempt the running task of the same
    /// class?
    fn check_preempt_curr(&self, rq: &mut RqInner, p: &Arc<Task>, wake_flags: u32) -> bool;

    /// Tick accounting for the running task; true asks for a reschedule.
    fn task_tick(&self, rq: &mut RqInner, curr: &Arc<Task>) -> bool;

    /// Wakeup placement among the CPUs in the task's affinity mask.
    fn select_task_rq(&self, core: &SchedCore, p: &Arc<Task>, prev_cpu: u32, wake_flags: u32)
        -> u32;

    fn set_cpus_allowed(&self, p: &Arc<Task>, mask: CpuMask) {
        let mut si = p.sched.lock();
        si.cpus_allowed = mask;
        si.nr_cpus_allowed = cpumask_weight(mask);
    }

    /// Leaving this class (policy change away from it).
    fn switched_from(&self, _rq: &mut RqInner, _p: &Arc<Task>) {}

    /// Arrived in this class; true asks for a reschedule.
    fn switched_to(&self, _rq: &mut RqInner, _p: &Arc<Task>) -> bool {
        false
    }

    /// Priority changed within this class; true asks for a reschedule.
    fn prio_changed(&self, _rq: &mut RqInner, _p: &Arc<Task>, _old_prio: i32) -> bool {
        false
    }
}

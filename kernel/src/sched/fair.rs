//! Fair scheduling class: weighted virtual runtime.
//!
//! Runnable entities sit in an ordered map keyed by (vruntime, pid); the
//! running one is kept out of the map and re-accrues runtime on every
//! clock update. Keys never change while an entity is in the map, since
//! only the running entity's vruntime moves.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::cpumask::{cpumask_iter, cpumask_test};
use crate::sched::class::{ClassId, SchedClass, ENQUEUE_WAKEUP};
use crate::sched::{RqInner, SchedCore};
use crate::task::{Pid, Task, SCHED_BATCH, SCHED_IDLE, SCHED_NORMAL};

/// Targeted preemption latency for CPU-bound tasks.
pub const SCHED_LATENCY_NS: u64 = 6_000_000;

/// Minimum slice any task gets inside the latency window.
pub const SCHED_MIN_GRANULARITY_NS: u64 = 750_000;

/// A waking task must lead the running one by this much virtual time
/// before it preempts.
pub const SCHED_WAKEUP_GRANULARITY_NS: u64 = 1_000_000;

/// Weight of one nice-0 task; the unit vruntime advances in.
pub const NICE_0_LOAD: u64 = 1024;

/// Per-queue fair-class state.
pub struct FairRunQueue {
    tree: BTreeMap<(u64, Pid), Arc<Task>>,
    /// Running fair entity, held out of the tree.
    curr: Option<Arc<Task>>,
    pub nr_running: u32,
    /// Monotonic floor under every queued vruntime; wakeup placement
    /// clamps against it so sleepers cannot hoard credit.
    pub min_vruntime: u64,
}

impl FairRunQueue {
    pub fn new() -> Self {
        FairRunQueue {
            tree: BTreeMap::new(),
            curr: None,
            nr_running: 0,
            min_vruntime: 0,
        }
    }

    /// Lowest-vruntime queued entity.
    pub fn leftmost(&self) -> Option<&Arc<Task>> {
        self.tree.values().next()
    }

    fn leftmost_key(&self) -> Option<u64> {
        self.tree.keys().next().map(|k| k.0)
    }

    fn is_curr(&self, p: &Arc<Task>) -> bool {
        matches!(self.curr.as_ref(), Some(curr) if Arc::ptr_eq(curr, p))
    }
}

impl Default for FairRunQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Scale `delta` by the task's weight relative to nice 0.
fn calc_delta_fair(delta: u64, load_weight: u64, load_inv_weight: u32) -> u64 {
    if load_weight == NICE_0_LOAD {
        return delta;
    }
    ((delta as u128 * NICE_0_LOAD as u128 * load_inv_weight as u128) >> 32) as u64
}

/// Wall-clock slice a queue of `nr_running` entities grants each one.
fn sched_slice(nr_running: u32) -> u64 {
    core::cmp::max(
        SCHED_LATENCY_NS / nr_running.max(1) as u64,
        SCHED_MIN_GRANULARITY_NS,
    )
}

fn entity_key(p: &Arc<Task>) -> (u64, Pid) {
    (p.sched.lock().se.vruntime, p.pid)
}

/// Accrue runtime and vruntime on the running fair entity.
fn update_curr(rq: &mut RqInner) {
    let curr = match rq.cfs.curr.clone() {
        Some(curr) => curr,
        None => return,
    };
    let now = rq.clock_task;
    let vruntime = {
        let mut si = curr.sched.lock();
        if now <= si.se.exec_start {
            return;
        }
        let delta = now - si.se.exec_start;
        si.se.exec_start = now;
        si.se.sum_exec_runtime += delta;
        si.se.vruntime += calc_delta_fair(delta, si.se.load_weight, si.se.load_inv_weight);
        si.se.vruntime
    };

    let mut floor = vruntime;
    if let Some(left) = rq.cfs.leftmost_key() {
        floor = core::cmp::min(floor, left);
    }
    rq.cfs.min_vruntime = core::cmp::max(rq.cfs.min_vruntime, floor);
}

pub struct FairClass;

impl SchedClass for FairClass {
    fn enqueue_task(&self, rq: &mut RqInner, p: &Arc<Task>, flags: u32) {
        update_curr(rq);

        let key = {
            let mut si = p.sched.lock();
            if flags & ENQUEUE_WAKEUP != 0 {
                // Sleepers resume at the queue floor rather than with
                // whatever stale credit they accumulated.
                si.se.vruntime = core::cmp::max(si.se.vruntime, rq.cfs.min_vruntime);
            }
            si.se.on_rq = true;
            (si.se.vruntime, p.pid)
        };
        if !rq.cfs.is_curr(p) {
            rq.cfs.tree.insert(key, p.clone());
        }
        rq.cfs.nr_running += 1;
    }

    fn dequeue_task(&self, rq: &mut RqInner, p: &Arc<Task>, _flags: u32) {
        update_curr(rq);

        let key = {
            let mut si = p.sched.lock();
            si.se.on_rq = false;
            (si.se.vruntime, p.pid)
        };
        if !rq.cfs.is_curr(p) {
            rq.cfs.tree.remove(&key);
        }
        rq.cfs.nr_running -= 1;
    }

    fn pick_next_task(&self, rq: &mut RqInner) -> Option<Arc<Task>> {
        if rq.cfs.nr_running == 0 {
            return None;
        }
        let (_, p) = rq.cfs.tree.pop_first()?;
        {
            let mut si = p.sched.lock();
            si.se.exec_start = rq.clock_task;
            si.se.prev_sum_exec_runtime = si.se.sum_exec_runtime;
        }
        rq.cfs.curr = Some(p.clone());
        Some(p)
    }

    fn put_prev_task(&self, rq: &mut RqInner, prev: &Arc<Task>) {
        let still_runnable = prev.sched.lock().se.on_rq;
        if still_runnable {
            update_curr(rq);
            rq.cfs.tree.insert(entity_key(prev), prev.clone());
        }
        if rq.cfs.is_curr(prev) {
            rq.cfs.curr = None;
        }
    }

    fn set_curr_task(&self, rq: &mut RqInner) {
        let p = rq.curr.clone();
        if p.sched.lock().se.on_rq {
            rq.cfs.tree.remove(&entity_key(&p));
        }
        {
            let mut si = p.sched.lock();
            si.se.exec_start = rq.clock_task;
            si.se.prev_sum_exec_runtime = si.se.sum_exec_runtime;
        }
        rq.cfs.curr = Some(p);
    }

    fn check_preempt_curr(&self, rq: &mut RqInner, p: &Arc<Task>, _wake_flags: u32) -> bool {
        let curr = rq.curr.clone();
        if Arc::ptr_eq(&curr, p) {
            return false;
        }

        let p_policy = p.sched.lock().policy;
        let curr_policy = curr.sched.lock().policy;
        // Batch and idle-policy wakeups never preempt.
        if p_policy == SCHED_BATCH || p_policy == SCHED_IDLE {
            return false;
        }
        // Anything normal preempts an idle-policy task on sight.
        if curr_policy == SCHED_IDLE && p_policy == SCHED_NORMAL {
            return true;
        }

        update_curr(rq);
        let curr_vruntime = curr.sched.lock().se.vruntime;
        let p_vruntime = p.sched.lock().se.vruntime;
        curr_vruntime.wrapping_sub(p_vruntime) as i64 > SCHED_WAKEUP_GRANULARITY_NS as i64
    }

    fn task_tick(&self, rq: &mut RqInner, curr: &Arc<Task>) -> bool {
        update_curr(rq);
        if rq.cfs.nr_running <= 1 {
            return false;
        }

        let ideal = sched_slice(rq.cfs.nr_running);
        let (ran, vruntime) = {
            let si = curr.sched.lock();
            (
                si.se.sum_exec_runtime - si.se.prev_sum_exec_runtime,
                si.se.vruntime,
            )
        };
        if ran > ideal {
            return true;
        }
        if ran < SCHED_MIN_GRANULARITY_NS {
            return false;
        }
        // Ahead of the leftmost waiter by a full slice: yield.
        match rq.cfs.leftmost_key() {
            Some(left) => vruntime.wrapping_sub(left) as i64 > ideal as i64,
            None => false,
        }
    }

    fn select_task_rq(
        &self,
        core: &SchedCore,
        p: &Arc<Task>,
        prev_cpu: u32,
        _wake_flags: u32,
    ) -> u32 {
        let allowed = p.sched.lock().cpus_allowed;
        let candidates = allowed & core.online_mask();
        if candidates == 0 {
            return prev_cpu;
        }

        // Stay put unless another allowed CPU is strictly idler.
        let mut best = if cpumask_test(candidates, prev_cpu) {
            prev_cpu
        } else {
            u32::MAX
        };
        let mut best_load = if best == u32::MAX {
            u32::MAX
        } else {
            core.rq(best).queued_load()
        };
        for cpu in cpumask_iter(candidates) {
            let load = core.rq(cpu).queued_load();
            if load < best_load {
                best = cpu;
                best_load = load;
            }
        }
        best
    }

    fn switched_to(&self, rq: &mut RqInner, p: &Arc<Task>) -> bool {
        if !p.on_rq_queued() {
            return false;
        }
        if Arc::ptr_eq(&rq.curr, p) {
            // Demoted while running: revisit the pick, a waiter of the
            // old class may now outrank it.
            return true;
        }
        let curr_class = rq.curr.sched.lock().class;
        match curr_class {
            ClassId::Idle => true,
            ClassId::Fair => self.check_preempt_curr(rq, p, 0),
            ClassId::RealTime => false,
        }
    }

    fn prio_changed(&self, rq: &mut RqInner, p: &Arc<Task>, old_prio: i32) -> bool {
        let running = Arc::ptr_eq(&rq.curr, p);
        if running {
            // Deprioritized while running: give others a chance.
            p.sched.lock().prio > old_prio
        } else {
            p.on_rq_queued() && self.check_preempt_curr(rq, p, 0)
        }
    }
}

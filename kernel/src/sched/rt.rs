//! Realtime scheduling class: FIFO and round-robin over 100 strict
//! priority levels.
//!
//! Each level is a FIFO list; a two-word bitmap tracks which levels hold
//! anything so pick is a couple of trailing-zero scans. Level 0 is the
//! strongest priority.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::RR_TIMESLICE;
use crate::cpumask::{cpumask_first, cpumask_test};
use crate::sched::class::{SchedClass, ENQUEUE_HEAD};
use crate::sched::{RqInner, SchedCore};
use crate::task::{Task, MAX_RT_PRIO, SCHED_RR};

/// Per-queue realtime state.
pub struct RtRunQueue {
    /// One FIFO per priority level, index = effective priority.
    active: Box<[VecDeque<Arc<Task>>]>,
    /// Bit per level with anything queued.
    bitmap: [u64; 2],
    /// Entities in the lists; the running one is not counted.
    pub rt_nr_running: u32,
}

impl RtRunQueue {
    pub fn new() -> Self {
        // Queues are created eagerly; levels are few and fixed.
        let mut active = Vec::with_capacity(MAX_RT_PRIO as usize);
        for _ in 0..MAX_RT_PRIO {
            active.push(VecDeque::new());
        }
        RtRunQueue {
            active: active.into_boxed_slice(),
            bitmap: [0; 2],
            rt_nr_running: 0,
        }
    }

    fn mark_level(&mut self, prio: usize) {
        self.bitmap[prio / 64] |= 1u64 << (prio % 64);
    }

    fn clear_level_if_empty(&mut self, prio: usize) {
        if self.active[prio].is_empty() {
            self.bitmap[prio / 64] &= !(1u64 << (prio % 64));
        }
    }

    /// Strongest non-empty level.
    fn highest_level(&self) -> Option<usize> {
        for (word_idx, &word) in self.bitmap.iter().enumerate() {
            if word != 0 {
                return Some(word_idx * 64 + word.trailing_zeros() as usize);
            }
        }
        None
    }

    fn enqueue(&mut self, p: &Arc<Task>, head: bool) {
        let prio = p.sched.lock().prio as usize;
        if head {
            self.active[prio].push_front(p.clone());
        } else {
            self.active[prio].push_back(p.clone());
        }
        self.mark_level(prio);
        self.rt_nr_running += 1;
    }

    fn dequeue(&mut self, p: &Arc<Task>) {
        let prio = p.sched.lock().prio as usize;
        if let Some(pos) = self.active[prio].iter().position(|t| t.pid == p.pid) {
            self.active[prio].remove(pos);
            self.rt_nr_running -= 1;
        }
        self.clear_level_if_empty(prio);
    }

    fn pop_highest(&mut self) -> Option<Arc<Task>> {
        let prio = self.highest_level()?;
        let p = self.active[prio].pop_front()?;
        self.rt_nr_running -= 1;
        self.clear_level_if_empty(prio);
        Some(p)
    }

    /// Queued entities at `prio`, not counting the running task.
    fn level_len(&self, prio: usize) -> usize {
        self.active[prio].len()
    }
}

impl Default for RtRunQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Accrue plain runtime on the running realtime entity; realtime tasks
/// have no virtual clock.
fn update_curr_rt(rq: &mut RqInner) {
    let curr = rq.curr.clone();
    let mut si = curr.sched.lock();
    if si.class != crate::sched::class::ClassId::RealTime {
        return;
    }
    let now = rq.clock_task;
    if now <= si.se.exec_start {
        return;
    }
    let delta = now - si.se.exec_start;
    si.se.exec_start = now;
    si.se.sum_exec_runtime += delta;
}

pub struct RtClass;

impl SchedClass for RtClass {
    fn enqueue_task(&self, rq: &mut RqInner, p: &Arc<Task>, flags: u32) {
        p.sched.lock().se.on_rq = true;
        // The running entity stays out of the level lists; restore after
        // a save/restore dance must not double-queue it.
        if Arc::ptr_eq(&rq.curr, p) {
            return;
        }
        rq.rt.enqueue(p, flags & ENQUEUE_HEAD != 0);
    }

    fn dequeue_task(&self, rq: &mut RqInner, p: &Arc<Task>, _flags: u32) {
        update_curr_rt(rq);
        rq.rt.dequeue(p);
        p.sched.lock().se.on_rq = false;
    }

    fn pick_next_task(&self, rq: &mut RqInner) -> Option<Arc<Task>> {
        let p = rq.rt.pop_highest()?;
        p.sched.lock().se.exec_start = rq.clock_task;
        Some(p)
    }

    fn put_prev_task(&self, rq: &mut RqInner, prev: &Arc<Task>) {
        update_curr_rt(rq);
        let (runnable, requeue_tail) = {
            let mut si = prev.sched.lock();
            let requeue = si.rt.requeue_tail;
            si.rt.requeue_tail = false;
            (si.se.on_rq, requeue)
        };
        if runnable {
            // An expired round-robin slice goes behind its level peers;
            // everything else resumes from the front.
            rq.rt.enqueue(prev, !requeue_tail);
        }
    }

    fn set_curr_task(&self, rq: &mut RqInner) {
        let p = rq.curr.clone();
        p.sched.lock().se.exec_start = rq.clock_task;
    }

    fn check_preempt_curr(&self, rq: &mut RqInner, p: &Arc<Task>, _wake_flags: u32) -> bool {
        let p_prio = p.sched.lock().prio;
        let curr_prio = rq.curr.sched.lock().prio;
        p_prio < curr_prio
    }

    fn task_tick(&self, rq: &mut RqInner, curr: &Arc<Task>) -> bool {
        update_curr_rt(rq);

        let mut si = curr.sched.lock();
        if si.policy != SCHED_RR {
            // FIFO runs until it blocks or something stronger arrives.
            return false;
        }
        if si.rt.time_slice > 1 {
            si.rt.time_slice -= 1;
            return false;
        }
        si.rt.time_slice = RR_TIMESLICE;

        // Round only matters when a peer waits at the same level.
        let prio = si.prio as usize;
        if rq.rt.level_len(prio) > 0 {
            si.rt.requeue_tail = true;
            return true;
        }
        false
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
        if cpumask_test(candidates, prev_cpu) {
            return prev_cpu;
        }
        cpumask_first(candidates).unwrap_or(prev_cpu)
    }

    fn switched_to(&self, rq: &mut RqInner, p: &Arc<Task>) -> bool {
        p.on_rq_queued() && !Arc::ptr_eq(&rq.curr, p) && self.check_preempt_curr(rq, p, 0)
    }

    fn prio_changed(&self, rq: &mut RqInner, p: &Arc<Task>, old_prio: i32) -> bool {
        let new_prio = p.sched.lock().prio;
        if Arc::ptr_eq(&rq.curr, p) {
            // Weakened while running: anything stronger should take over.
            new_prio > old_prio
        } else {
            p.on_rq_queued() && new_prio < rq.curr.sched.lock().prio
        }
    }
}

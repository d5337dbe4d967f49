//! Idle scheduling class.
//!
//! One pinned idle task per CPU, picked when every other class comes up
//! empty, which makes pick total: some task always runs. Idle tasks are
//! never enqueued anywhere, so the queue hooks existing at all would mean
//! queue state got corrupted.

use alloc::sync::Arc;

use crate::sched::class::SchedClass;
use crate::sched::{RqInner, SchedCore};
use crate::task::Task;

pub struct IdleClass;

impl SchedClass for IdleClass {
    fn enqueue_task(&self, _rq: &mut RqInner, p: &Arc<Task>, _flags: u32) {
        panic!("sched: idle task {} cannot be enqueued", p.pid);
    }

    fn dequeue_task(&self, _rq: &mut RqInner, p: &Arc<Task>, _flags: u32) {
        panic!("sched: idle task {} cannot be dequeued", p.pid);
    }

    fn pick_next_task(&self, rq: &mut RqInner) -> Option<Arc<Task>> {
        let idle = rq.idle.clone();
        idle.sched.lock().se.exec_start = rq.clock_task;
        Some(idle)
    }

    fn put_prev_task(&self, _rq: &mut RqInner, _prev: &Arc<Task>) {}

    fn set_curr_task(&self, rq: &mut RqInner) {
        let exec_start = rq.clock_task;
        rq.idle.sched.lock().se.exec_start = exec_start;
    }

    fn check_preempt_curr(&self, _rq: &mut RqInner, _p: &Arc<Task>, _wake_flags: u32) -> bool {
        // Cross-class ranking already preempts idle; same-class cannot
        // happen since idle tasks never wake another idle task.
        true
    }

    fn task_tick(&self, _rq: &mut RqInner, _curr: &Arc<Task>) -> bool {
        false
    }

    fn select_task_rq(
        &self,
        _core: &SchedCore,
        _p: &Arc<Task>,
        prev_cpu: u32,
        _wake_flags: u32,
    ) -> u32 {
        prev_cpu
    }
}

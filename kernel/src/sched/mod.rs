//! Run queues and the scheduler core.
//!
//! One run queue per CPU. The host drives this code from its own loop:
//! [`Scheduler::scheduler_tick`] from the timer, [`Scheduler::schedule`]
//! at scheduling points, wakeups from wherever events land. Preemption is
//! a mark on the running task plus a reschedule kick through
//! [`crate::services::SchedArch`]; the switch itself always happens inside
//! `schedule` on the owning CPU.
//!
//! Lock order: task pi lock, then run-queue lock, then per-task sched
//! lock. No path holds two run-queue locks; cross-CPU moves release the
//! source before taking the destination, with the task marked migrating
//! in between so lookups wait it out.

pub mod class;
pub mod cpu_stop;
pub mod fair;
pub mod idle;
pub mod rt;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use log::{debug, warn};
use spin::{Mutex, MutexGuard};

use crate::config::MAX_CPUS;
use crate::cpumask::{
    cpumask_first, cpumask_first_and, cpumask_intersects, cpumask_of, cpumask_test, CpuMask,
    CPU_MASK_ALL,
};
use crate::error::{KernelError, KernelResult};
use crate::sched::class::{
    ClassId, DEQUEUE_SAVE, DEQUEUE_SLEEP, ENQUEUE_RESTORE, ENQUEUE_WAKEUP, WF_FORK,
};
use crate::sched::cpu_stop::{CpuStopQueue, StopDone, StopWork};
use crate::sched::fair::FairRunQueue;
use crate::sched::rt::RtRunQueue;
use crate::services::SchedArch;
use crate::task::{
    idle_policy, nice_to_prio, prio_to_nice, rt_policy, valid_policy, Pid, SchedEntity,
    SchedInfo, SchedParam, Task, MAX_PRIO, MAX_RT_PRIO, PF_IDLE, PF_NO_SETAFFINITY, PF_STOPPER,
    SCHED_NORMAL, SCHED_RESET_ON_FORK, TASK_DEAD, TASK_NEW, TASK_NORMAL, TASK_ON_RQ_MIGRATING,
    TASK_ON_RQ_QUEUED, TASK_RUNNING, TASK_UNINTERRUPTIBLE, TASK_WAKING,
};

// Nice-level load weights, nice 0 at index 20. Each step is ~1.25x so one
// nice level trades about 10% CPU.
pub(crate) const SCHED_PRIO_TO_WEIGHT: [u64; 40] = [
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916, 9548, 7620, 6100, 4904,
    3906, 3121, 2501, 1991, 1586, 1277, 1024, 820, 655, 526, 423, 335, 272, 215, 172, 137, 110,
    87, 70, 56, 45, 36, 29, 23, 18, 15,
];

// Inverse weights: 2^32 / weight, so scaling divides without dividing.
pub(crate) const SCHED_PRIO_TO_WMULT: [u32; 40] = [
    48388, 59856, 76040, 92818, 118348, 147320, 184698, 229616, 287308, 360437, 449829, 563644,
    704093, 875809, 1099582, 1376151, 1717300, 2157191, 2708050, 3363326, 4194304, 5237765,
    6557202, 8165337, 10153587, 12820798, 15790321, 19976592, 24970740, 31350126, 39045157,
    49367440, 61356676, 76695844, 95443717, 119304647, 148102320, 186737708, 238609294, 286331153,
];

/// Weight of SCHED_IDLE-policy tasks: barely-there background work.
const WEIGHT_IDLEPRIO: u64 = 3;
const WMULT_IDLEPRIO: u32 = 1_431_655_765;

// Clock update suppression: a requested skip becomes active for exactly
// the next schedule pass.
const RQCF_REQ_SKIP: u8 = 0x01;
const RQCF_ACT_SKIP: u8 = 0x02;

/// Quick-spin iterations before waits start yielding through cpu_relax.
const SPIN_BUDGET: u32 = 1 << 10;

/// Run-queue state guarded by the queue lock.
pub struct RqInner {
    pub clock: u64,
    /// Task-visible clock; what execution time accrues against.
    pub clock_task: u64,
    clock_skip_update: u8,
    pub nr_switches: u64,
    pub curr: Arc<Task>,
    pub idle: Arc<Task>,
    pub stopper: Arc<Task>,
    pub cfs: FairRunQueue,
    pub rt: RtRunQueue,
}

pub struct RunQueue {
    pub cpu: u32,
    /// Queued task count, readable without the queue lock for placement.
    pub nr_running: AtomicU32,
    /// Uninterruptible sleepers that left this queue and have not been
    /// woken yet; every increment is paired with exactly one decrement.
    pub nr_uninterruptible: AtomicI64,
    pub stop: CpuStopQueue,
    inner: Mutex<RqInner>,
}

impl RunQueue {
    fn new(cpu: u32, idle: Arc<Task>, stopper: Arc<Task>) -> Self {
        RunQueue {
            cpu,
            nr_running: AtomicU32::new(0),
            nr_uninterruptible: AtomicI64::new(0),
            stop: CpuStopQueue::new(),
            inner: Mutex::new(RqInner {
                clock: 0,
                clock_task: 0,
                clock_skip_update: 0,
                nr_switches: 0,
                curr: idle.clone(),
                idle,
                stopper,
                cfs: FairRunQueue::new(),
                rt: RtRunQueue::new(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RqInner> {
        self.inner.lock()
    }

    /// Placement load metric.
    pub fn queued_load(&self) -> u32 {
        self.nr_running.load(Ordering::Relaxed)
    }
}

pub(crate) struct RqGuard<'a> {
    pub rq: &'a RunQueue,
    pub inner: MutexGuard<'a, RqInner>,
}

pub(crate) struct TaskRqLock<'a> {
    pub pi: MutexGuard<'a, ()>,
    pub rq: &'a RunQueue,
    pub inner: MutexGuard<'a, RqInner>,
}

/// Queues, the task directory, and CPU topology; everything the scheduler
/// owns that is not the hardware seam.
pub struct SchedCore {
    rqs: Box<[RunQueue]>,
    online: AtomicU64,
    tasks: Mutex<BTreeMap<Pid, Arc<Task>>>,
    next_pid: AtomicU64,
}

impl SchedCore {
    pub fn rq(&self, cpu: u32) -> &RunQueue {
        &self.rqs[cpu as usize]
    }

    pub fn nr_cpus(&self) -> usize {
        self.rqs.len()
    }

    pub fn cpu_online(&self, cpu: u32) -> bool {
        cpumask_test(self.online_mask(), cpu)
    }

    pub fn online_mask(&self) -> CpuMask {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_cpu_online(&self, cpu: u32, online: bool) {
        if online {
            self.online.fetch_or(1u64 << cpu, Ordering::Release);
        } else {
            self.online.fetch_and(!(1u64 << cpu), Ordering::Release);
        }
    }

    pub fn task_by_pid(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().get(&pid).cloned()
    }

    /// Running task of `cpu` right now.
    pub fn current_task(&self, cpu: u32) -> Arc<Task> {
        self.rq(cpu).inner.lock().curr.clone()
    }

    pub fn idle_task(&self, cpu: u32) -> Arc<Task> {
        self.rq(cpu).inner.lock().idle.clone()
    }

    /// Node-wide uninterruptible-sleeper count.
    pub fn nr_uninterruptible(&self) -> i64 {
        self.rqs
            .iter()
            .map(|rq| rq.nr_uninterruptible.load(Ordering::Relaxed))
            .sum()
    }

    fn alloc_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, task: Arc<Task>) {
        self.tasks.lock().insert(task.pid, task);
    }

    fn unregister(&self, pid: Pid) {
        self.tasks.lock().remove(&pid);
    }

    /// Lock the queue currently owning `p`, rechecking after acquisition
    /// since wakeup placement can move the task first.
    fn __task_rq_lock(&self, p: &Task) -> RqGuard<'_> {
        loop {
            let cpu = p.cpu.load(Ordering::Acquire);
            let rq = self.rq(cpu);
            let inner = rq.inner.lock();
            if p.cpu.load(Ordering::Acquire) == cpu && !p.on_rq_migrating() {
                return RqGuard { rq, inner };
            }
            drop(inner);
            while p.on_rq_migrating() {
                core::hint::spin_loop();
            }
        }
    }

    fn task_rq_lock<'a>(&'a self, p: &'a Task) -> TaskRqLock<'a> {
        let pi = p.pi_lock.lock();
        let guard = self.__task_rq_lock(p);
        TaskRqLock {
            pi,
            rq: guard.rq,
            inner: guard.inner,
        }
    }
}

fn set_load_weight(si: &mut SchedInfo) {
    if idle_policy(si.policy) {
        si.se.load_weight = WEIGHT_IDLEPRIO;
        si.se.load_inv_weight = WMULT_IDLEPRIO;
        return;
    }
    let index = (si.static_prio - MAX_RT_PRIO) as usize;
    si.se.load_weight = SCHED_PRIO_TO_WEIGHT[index];
    si.se.load_inv_weight = SCHED_PRIO_TO_WMULT[index];
}

/// Priority the task deserves from policy alone.
fn normal_prio(si: &SchedInfo) -> i32 {
    if rt_policy(si.policy) {
        MAX_RT_PRIO - 1 - si.rt_priority as i32
    } else {
        si.static_prio
    }
}

/// The scheduler: per-CPU queues plus the hardware seam that kicks CPUs
/// and performs the actual switch.
pub struct Scheduler<A: SchedArch> {
    pub arch: A,
    pub core: SchedCore,
}

impl<A: SchedArch> Scheduler<A> {
    /// Build queues for `nr_cpus` CPUs, each with its pinned idle and
    /// stopper task, everything online.
    pub fn new(arch: A, nr_cpus: usize) -> Self {
        assert!(nr_cpus >= 1 && nr_cpus <= MAX_CPUS);

        let next_pid = AtomicU64::new(1);
        let mut rqs = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus as u32 {
            let idle = Arc::new(Task::new(0, 0, 0, &format!("swapper/{}", cpu), None));
            idle.flags.store(PF_IDLE, Ordering::Relaxed);
            idle.set_state(TASK_RUNNING);
            idle.cpu.store(cpu, Ordering::Relaxed);
            idle.wake_cpu.store(cpu, Ordering::Relaxed);
            idle.on_cpu.store(true, Ordering::Relaxed);
            idle.on_rq.store(TASK_ON_RQ_QUEUED, Ordering::Relaxed);
            {
                let mut si = idle.sched.lock();
                si.class = ClassId::Idle;
                si.prio = MAX_PRIO;
                si.normal_prio = MAX_PRIO;
                si.cpus_allowed = cpumask_of(cpu);
                si.nr_cpus_allowed = 1;
            }

            let stopper = Arc::new(Task::new(
                next_pid.fetch_add(1, Ordering::Relaxed),
                0,
                0,
                &format!("migration/{}", cpu),
                None,
            ));
            stopper
                .flags
                .store(PF_STOPPER | PF_NO_SETAFFINITY, Ordering::Relaxed);
            stopper.set_state(TASK_RUNNING);
            stopper.cpu.store(cpu, Ordering::Relaxed);
            stopper.wake_cpu.store(cpu, Ordering::Relaxed);
            {
                let mut si = stopper.sched.lock();
                // Stoppers sit outside the class ranking and never queue;
                // the tag only parks them somewhere harmless.
                si.class = ClassId::Idle;
                si.prio = 0;
                si.normal_prio = 0;
                si.cpus_allowed = cpumask_of(cpu);
                si.nr_cpus_allowed = 1;
            }

            rqs.push(RunQueue::new(cpu, idle, stopper));
        }

        let online = if nr_cpus == MAX_CPUS {
            CPU_MASK_ALL
        } else {
            (1u64 << nr_cpus) - 1
        };
        Scheduler {
            arch,
            core: SchedCore {
                rqs: rqs.into_boxed_slice(),
                online: AtomicU64::new(online),
                tasks: Mutex::new(BTreeMap::new()),
                next_pid,
            },
        }
    }

    /// Allocate a task, inherit scheduling identity from `parent`, and
    /// register it in the directory. The task still needs
    /// [`Scheduler::wake_up_new_task`] to start running.
    pub fn create_task(
        &self,
        comm: &str,
        mm: Option<Arc<crate::mm::AddressSpace>>,
        parent: Option<&Arc<Task>>,
        cpu: u32,
    ) -> KernelResult<Arc<Task>> {
        let pid = self.core.alloc_pid();
        let ppid = parent.map(|parent| parent.pid).unwrap_or(0);
        let task = Arc::new(Task::new(pid, ppid, 0, comm, mm));
        self.sched_fork(parent, &task, cpu)?;
        self.core.register(task.clone());
        Ok(task)
    }

    /// Scheduling setup for a freshly built task.
    pub fn sched_fork(
        &self,
        parent: Option<&Arc<Task>>,
        p: &Arc<Task>,
        cpu: u32,
    ) -> KernelResult<()> {
        if cpu as usize >= self.core.nr_cpus() {
            return Err(KernelError::InvalidArgument);
        }
        p.set_state(TASK_NEW);
        {
            let mut si = p.sched.lock();
            si.se = SchedEntity::default();
            si.rt = Default::default();

            if let Some(parent) = parent {
                let psi = parent.sched.lock();
                si.policy = psi.policy;
                si.static_prio = psi.static_prio;
                si.rt_priority = psi.rt_priority;
                si.cpus_allowed = psi.cpus_allowed;
                si.nr_cpus_allowed = psi.nr_cpus_allowed;
                si.reset_on_fork = psi.reset_on_fork;
                si.prio = psi.normal_prio;
                si.se.vruntime = psi.se.vruntime;
            }

            if si.reset_on_fork {
                if rt_policy(si.policy) {
                    si.policy = SCHED_NORMAL;
                    si.static_prio = nice_to_prio(0);
                    si.rt_priority = 0;
                } else if prio_to_nice(si.static_prio) < 0 {
                    si.static_prio = nice_to_prio(0);
                }
                si.prio = si.static_prio;
                // The reset applies once, not to grandchildren.
                si.reset_on_fork = false;
            }
            si.normal_prio = si.prio;
            si.class = ClassId::for_prio(si.prio);
            set_load_weight(&mut si);
        }
        self.__set_task_cpu(p, cpu);
        p.on_cpu.store(false, Ordering::Relaxed);
        p.on_rq.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// First wakeup of a forked task: place it, queue it, let it compete.
    pub fn wake_up_new_task(&self, p: &Arc<Task>) {
        let _pi = p.pi_lock.lock();
        p.set_state(TASK_RUNNING);
        let cpu = self.select_task_rq(p, p.cpu.load(Ordering::Relaxed), WF_FORK);
        self.__set_task_cpu(p, cpu);

        let RqGuard { rq, mut inner } = self.core.__task_rq_lock(p);
        self.update_rq_clock(&mut inner);
        // Entering as a wakeup pins the child's vruntime to the queue
        // floor instead of whatever it inherited.
        self.activate_task(rq, &mut inner, p, ENQUEUE_WAKEUP);
        p.on_rq.store(TASK_ON_RQ_QUEUED, Ordering::Release);
        self.check_preempt_curr(rq, &mut inner, p, WF_FORK);
    }

    // ==== wakeup path ====

    /// Wake `p` if its state matches `state_mask`. Returns whether this
    /// call performed the wakeup.
    pub fn try_to_wake_up(&self, p: &Arc<Task>, state_mask: u32, wake_flags: u32) -> bool {
        let _pi = p.pi_lock.lock();
        if p.task_state() & state_mask == 0 {
            return false;
        }

        // Still queued: it never left, just flip it back to running.
        if p.on_rq_queued() && self.ttwu_remote(p, wake_flags) {
            return true;
        }

        // Wait for the previous CPU to finish descheduling it.
        self.spin_until(|| !p.on_cpu.load(Ordering::Acquire));

        p.set_contributes_to_load(p.task_state() & TASK_UNINTERRUPTIBLE != 0);
        p.set_state(TASK_WAKING);

        let prev_cpu = p.wake_cpu.load(Ordering::Relaxed);
        let cpu = self.select_task_rq(p, prev_cpu, wake_flags);
        if cpu != p.cpu.load(Ordering::Relaxed) {
            self.set_task_cpu(p, cpu);
        }
        self.ttwu_queue(p, cpu, wake_flags);
        true
    }

    pub fn wake_up_process(&self, p: &Arc<Task>) -> bool {
        self.try_to_wake_up(p, TASK_NORMAL, 0)
    }

    pub fn wake_up_state(&self, p: &Arc<Task>, state_mask: u32) -> bool {
        self.try_to_wake_up(p, state_mask, 0)
    }

    /// Fast path: the sleeper was marked asleep but never got descheduled.
    fn ttwu_remote(&self, p: &Arc<Task>, wake_flags: u32) -> bool {
        let RqGuard { rq, mut inner } = self.core.__task_rq_lock(p);
        if p.on_rq_queued() {
            self.update_rq_clock(&mut inner);
            self.check_preempt_curr(rq, &mut inner, p, wake_flags);
            p.set_state(TASK_RUNNING);
            return true;
        }
        false
    }

    fn ttwu_queue(&self, p: &Arc<Task>, cpu: u32, wake_flags: u32) {
        let rq = self.core.rq(cpu);
        let mut inner = rq.inner.lock();
        self.update_rq_clock(&mut inner);
        self.activate_task(rq, &mut inner, p, ENQUEUE_WAKEUP);
        p.on_rq.store(TASK_ON_RQ_QUEUED, Ordering::Release);
        self.check_preempt_curr(rq, &mut inner, p, wake_flags);
        p.set_state(TASK_RUNNING);
    }

    /// Wakeup placement: the task's class chooses among its allowed CPUs;
    /// anything unusable falls back below.
    fn select_task_rq(&self, p: &Arc<Task>, prev_cpu: u32, wake_flags: u32) -> u32 {
        let (class, allowed, nr_allowed) = {
            let si = p.sched.lock();
            (si.class, si.cpus_allowed, si.nr_cpus_allowed)
        };
        let mut cpu = if nr_allowed > 1 {
            class.ops().select_task_rq(&self.core, p, prev_cpu, wake_flags)
        } else {
            cpumask_first(allowed).unwrap_or(prev_cpu)
        };
        if !cpumask_test(allowed, cpu) || !self.core.cpu_online(cpu) {
            cpu = self.select_fallback_rq(p, allowed);
        }
        cpu
    }

    fn select_fallback_rq(&self, p: &Arc<Task>, allowed: CpuMask) -> u32 {
        if let Some(cpu) = cpumask_first_and(allowed, self.core.online_mask()) {
            return cpu;
        }
        // Every allowed CPU is gone; widen the mask rather than strand
        // the task.
        warn!(
            "sched: task {} has no online CPU in mask {:#x}, falling back to all",
            p.pid, allowed
        );
        {
            let mut si = p.sched.lock();
            si.cpus_allowed = CPU_MASK_ALL;
            si.nr_cpus_allowed = MAX_CPUS as u32;
        }
        cpumask_first(self.core.online_mask()).unwrap_or(0)
    }

    // ==== queue primitives ====

    fn enqueue_task(&self, rq: &RunQueue, inner: &mut RqInner, p: &Arc<Task>, flags: u32) {
        let class = p.sched.lock().class;
        class.ops().enqueue_task(inner, p, flags);
        rq.nr_running.fetch_add(1, Ordering::Relaxed);
    }

    fn dequeue_task(&self, rq: &RunQueue, inner: &mut RqInner, p: &Arc<Task>, flags: u32) {
        let class = p.sched.lock().class;
        class.ops().dequeue_task(inner, p, flags);
        rq.nr_running.fetch_sub(1, Ordering::Relaxed);
    }

    fn activate_task(&self, rq: &RunQueue, inner: &mut RqInner, p: &Arc<Task>, flags: u32) {
        if p.take_contributes_to_load() {
            rq.nr_uninterruptible.fetch_sub(1, Ordering::Relaxed);
        }
        self.enqueue_task(rq, inner, p, flags);
    }

    fn deactivate_task(&self, rq: &RunQueue, inner: &mut RqInner, p: &Arc<Task>, flags: u32) {
        if p.task_state() & TASK_UNINTERRUPTIBLE != 0 {
            rq.nr_uninterruptible.fetch_add(1, Ordering::Relaxed);
        }
        self.dequeue_task(rq, inner, p, flags);
    }

    fn update_rq_clock(&self, inner: &mut RqInner) {
        if inner.clock_skip_update & RQCF_ACT_SKIP != 0 {
            return;
        }
        let now = self.arch.sched_clock();
        if now < inner.clock {
            return;
        }
        let delta = now - inner.clock;
        inner.clock = now;
        inner.clock_task += delta;
    }

    /// Mark the running task for reschedule and kick its CPU. The queue
    /// lock must be held. CPUs notice their own mark at the next
    /// scheduling point; the kick is for remote queues.
    fn resched_curr(&self, rq: &RunQueue, inner: &RqInner) {
        if inner.curr.set_need_resched() {
            return;
        }
        self.arch.send_reschedule(rq.cpu);
    }

    /// Should the woken task `p` take the CPU from whatever runs there?
    fn check_preempt_curr(&self, rq: &RunQueue, inner: &mut RqInner, p: &Arc<Task>, wake_flags: u32) {
        let curr = inner.curr.clone();
        if curr.is_stopper() {
            // Pending stop work yields to nothing.
            return;
        }
        let p_class = p.sched.lock().class;
        let curr_class = curr.sched.lock().class;
        let resched = if p_class == curr_class {
            p_class.ops().check_preempt_curr(inner, p, wake_flags)
        } else {
            p_class < curr_class
        };
        if resched {
            self.resched_curr(rq, inner);
        }
        // The wakeup already refreshed the clock; a switch right behind
        // it can skip the second update.
        if curr.on_rq_queued() && curr.need_resched() {
            inner.clock_skip_update |= RQCF_REQ_SKIP;
        }
    }

    fn set_task_cpu(&self, p: &Arc<Task>, new_cpu: u32) {
        let state = p.task_state();
        if state != TASK_RUNNING
            && state != TASK_WAKING
            && !p.on_rq_queued()
            && !p.on_rq_migrating()
            && state != TASK_NEW
        {
            warn!(
                "sched: task {} changes CPU in unexpected state {:#x}",
                p.pid, state
            );
        }
        self.__set_task_cpu(p, new_cpu);
    }

    fn __set_task_cpu(&self, p: &Arc<Task>, cpu: u32) {
        p.cpu.store(cpu, Ordering::Release);
        p.wake_cpu.store(cpu, Ordering::Release);
    }

    // ==== the scheduling point ====

    /// Pick whoever runs next. The outgoing task goes back to its class
    /// first, so the choice sees every runnable entity.
    fn pick_next_task(&self, rq: &RunQueue, inner: &mut RqInner, prev: &Arc<Task>) -> Arc<Task> {
        if !prev.is_stopper() {
            let class = prev.sched.lock().class;
            class.ops().put_prev_task(inner, prev);
        }

        if rq.stop.pending() {
            return inner.stopper.clone();
        }
        for class in ClassId::RANKED {
            if let Some(next) = class.ops().pick_next_task(inner) {
                return next;
            }
        }
        panic!(
            "sched: cpu {} found no runnable task; the idle class must always yield one",
            rq.cpu
        );
    }

    fn __schedule(&self, cpu: u32, preempt: bool) {
        let rq = self.core.rq(cpu);
        let mut inner = rq.inner.lock();
        let prev = inner.curr.clone();

        // A requested clock skip becomes active for this pass only.
        inner.clock_skip_update <<= 1;
        self.update_rq_clock(&mut inner);

        if !preempt && prev.task_state() != TASK_RUNNING {
            self.deactivate_task(rq, &mut inner, &prev, DEQUEUE_SLEEP);
            prev.on_rq.store(0, Ordering::Release);
        }

        let next = self.pick_next_task(rq, &mut inner, &prev);
        prev.clear_need_resched();
        inner.clock_skip_update = 0;

        if !Arc::ptr_eq(&prev, &next) {
            inner.nr_switches += 1;
            inner.curr = next.clone();
            self.context_switch(inner, &prev, &next);
        }
    }

    fn context_switch(&self, inner: MutexGuard<'_, RqInner>, prev: &Arc<Task>, next: &Arc<Task>) {
        next.on_cpu.store(true, Ordering::Release);
        self.arch.switch_mm(prev.mm.as_deref(), next.mm.as_deref());
        self.arch.switch_to(prev, next);
        self.finish_task_switch(inner, prev);
    }

    fn finish_task_switch(&self, inner: MutexGuard<'_, RqInner>, prev: &Arc<Task>) {
        let dead = prev.task_state() == TASK_DEAD;
        // Pairs with the on_cpu spin in try_to_wake_up.
        prev.on_cpu.store(false, Ordering::Release);
        drop(inner);
        if dead {
            debug!("sched: task {} ({}) released", prev.pid, prev.comm());
            self.core.unregister(prev.pid);
        }
    }

    /// One scheduling point: deschedule the current task (deactivating it
    /// if it went to sleep), run any pending stop works, and switch to
    /// the best runnable task.
    pub fn schedule(&self, cpu: u32) {
        loop {
            self.__schedule(cpu, false);
            let rq = self.core.rq(cpu);
            let is_stopper = rq.inner.lock().curr.is_stopper();
            if !is_stopper {
                break;
            }
            self.run_stop_works(cpu);
        }
    }

    /// Scheduling point for involuntary preemption: the outgoing task
    /// stays queued even if it already marked itself asleep.
    pub fn preempt_schedule(&self, cpu: u32) {
        self.__schedule(cpu, true);
    }

    /// Timer tick on `cpu`: accrue runtime and let the running task's
    /// class decide whether its slice is up.
    pub fn scheduler_tick(&self, cpu: u32) {
        let rq = self.core.rq(cpu);
        let mut inner = rq.inner.lock();
        self.update_rq_clock(&mut inner);
        let curr = inner.curr.clone();
        let class = curr.sched.lock().class;
        if class.ops().task_tick(&mut inner, &curr) {
            self.resched_curr(rq, &inner);
        }
    }

    /// Terminal exit: mark the running task dead and schedule away from
    /// it. The directory entry drops once the switch completes.
    pub fn do_task_dead(&self, cpu: u32) {
        let curr = self.core.current_task(cpu);
        curr.set_state(TASK_DEAD);
        self.__schedule(cpu, false);
    }

    // ==== stop works and migration ====

    /// Queue a migration work on `cpu` and wait for its stopper to run it.
    pub fn stop_one_cpu(&self, cpu: u32, task: Arc<Task>, dest_cpu: u32) {
        let done = Arc::new(StopDone::new());
        let rq = self.core.rq(cpu);
        rq.stop.push(StopWork {
            task,
            dest_cpu,
            done: done.clone(),
        });
        {
            let inner = rq.inner.lock();
            self.resched_curr(rq, &inner);
        }
        self.spin_until(|| done.is_complete());
    }

    fn run_stop_works(&self, cpu: u32) {
        let rq = self.core.rq(cpu);
        while let Some(work) = rq.stop.pop() {
            self.migration_stop_work(rq, &work);
            work.done.complete();
        }
        rq.stop.finish_round();
    }

    /// Body of a migration work, executed at the stopper's scheduling
    /// point on the source CPU.
    fn migration_stop_work(&self, rq: &RunQueue, work: &StopWork) {
        let inner = rq.inner.lock();
        let p = &work.task;
        if p.cpu.load(Ordering::Acquire) == rq.cpu && p.on_rq_queued() {
            self.__migrate_task(rq, inner, p, work.dest_cpu);
        }
    }

    /// Move a queued task if the destination is still usable. An aborted
    /// move leaves the task where it is; the affinity mask update that
    /// requested it stays in force either way.
    fn __migrate_task(
        &self,
        rq: &RunQueue,
        inner: MutexGuard<'_, RqInner>,
        p: &Arc<Task>,
        dest_cpu: u32,
    ) {
        if !self.core.cpu_online(dest_cpu) {
            warn!(
                "sched: move of task {} to offline cpu {} aborted",
                p.pid, dest_cpu
            );
            return;
        }
        if !cpumask_test(p.sched.lock().cpus_allowed, dest_cpu) {
            return;
        }
        self.move_queued_task(rq, inner, p, dest_cpu);
    }

    /// Hand a queued task from one queue to another. The source lock
    /// drops before the destination lock is taken; the migrating mark
    /// keeps lookups away in the window between.
    fn move_queued_task(
        &self,
        src: &RunQueue,
        mut src_inner: MutexGuard<'_, RqInner>,
        p: &Arc<Task>,
        new_cpu: u32,
    ) {
        p.on_rq.store(TASK_ON_RQ_MIGRATING, Ordering::Release);
        self.dequeue_task(src, &mut src_inner, p, 0);
        self.__set_task_cpu(p, new_cpu);
        drop(src_inner);

        let dst = self.core.rq(new_cpu);
        let mut dst_inner = dst.inner.lock();
        if p.cpu.load(Ordering::Acquire) != new_cpu {
            panic!(
                "sched: task {} moved to cpu {} while migrating to {}",
                p.pid,
                p.cpu.load(Ordering::Acquire),
                new_cpu
            );
        }
        self.update_rq_clock(&mut dst_inner);
        self.enqueue_task(dst, &mut dst_inner, p, 0);
        p.on_rq.store(TASK_ON_RQ_QUEUED, Ordering::Release);
        self.check_preempt_curr(dst, &mut dst_inner, p, 0);
    }

    // ==== affinity ====

    /// Change affinity on behalf of the task itself; no permission check.
    pub fn set_cpus_allowed_ptr(&self, p: &Arc<Task>, new_mask: CpuMask) -> KernelResult<()> {
        self.__set_cpus_allowed(p, new_mask, false)
    }

    /// Change affinity of `pid` with the pinned-task check applied.
    pub fn sched_setaffinity(&self, pid: Pid, mask: CpuMask) -> KernelResult<()> {
        let p = self
            .core
            .task_by_pid(pid)
            .ok_or(KernelError::NoProcess)?;
        self.__set_cpus_allowed(&p, mask, true)
    }

    fn __set_cpus_allowed(&self, p: &Arc<Task>, new_mask: CpuMask, check: bool) -> KernelResult<()> {
        let lock = self.core.task_rq_lock(p);
        let pi = lock.pi;
        let rq = lock.rq;
        let mut inner = lock.inner;
        self.update_rq_clock(&mut inner);

        if check && p.task_flags() & PF_NO_SETAFFINITY != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if p.sched.lock().cpus_allowed == new_mask {
            return Ok(());
        }
        if !cpumask_intersects(new_mask, self.core.online_mask()) {
            return Err(KernelError::InvalidArgument);
        }

        self.do_set_cpus_allowed(rq, &mut inner, p, new_mask);

        if cpumask_test(new_mask, p.cpu.load(Ordering::Acquire)) {
            return Ok(());
        }

        let dest_cpu = match cpumask_first_and(new_mask, self.core.online_mask()) {
            Some(cpu) => cpu,
            None => return Err(KernelError::InvalidArgument),
        };
        if Arc::ptr_eq(&inner.curr, p) || p.task_state() == TASK_WAKING {
            // Running tasks move at their own scheduling point, through
            // the stopper on their CPU.
            let src_cpu = rq.cpu;
            drop(inner);
            drop(pi);
            self.stop_one_cpu(src_cpu, p.clone(), dest_cpu);
        } else if p.on_rq_queued() {
            self.move_queued_task(rq, inner, p, dest_cpu);
        }
        Ok(())
    }

    /// Apply a new mask with the task temporarily off its queue.
    fn do_set_cpus_allowed(&self, rq: &RunQueue, inner: &mut RqInner, p: &Arc<Task>, mask: CpuMask) {
        let queued = p.on_rq_queued();
        let running = Arc::ptr_eq(&inner.curr, p);
        let class = p.sched.lock().class;

        if queued {
            self.dequeue_task(rq, inner, p, DEQUEUE_SAVE);
        }
        if running {
            class.ops().put_prev_task(inner, p);
        }
        class.ops().set_cpus_allowed(p, mask);
        if queued {
            self.enqueue_task(rq, inner, p, ENQUEUE_RESTORE);
        }
        if running {
            class.ops().set_curr_task(inner);
        }
    }

    // ==== policy and priority ====

    /// Change policy and realtime priority, moving the task between
    /// classes as needed.
    pub fn sched_setscheduler(
        &self,
        p: &Arc<Task>,
        policy: i32,
        param: &SchedParam,
    ) -> KernelResult<()> {
        let reset_on_fork = policy & SCHED_RESET_ON_FORK != 0;
        let policy = policy & !SCHED_RESET_ON_FORK;

        if !valid_policy(policy) {
            return Err(KernelError::InvalidArgument);
        }
        if rt_policy(policy) {
            if param.sched_priority < 1 || param.sched_priority > MAX_RT_PRIO - 1 {
                return Err(KernelError::InvalidArgument);
            }
        } else if param.sched_priority != 0 {
            return Err(KernelError::InvalidArgument);
        }
        // Neither per-CPU service task accepts policy games.
        if p.task_flags() & (PF_IDLE | PF_STOPPER) != 0 {
            return Err(KernelError::InvalidArgument);
        }

        let lock = self.core.task_rq_lock(p);
        let _pi = lock.pi;
        let rq = lock.rq;
        let mut inner = lock.inner;
        self.update_rq_clock(&mut inner);

        let queued = p.on_rq_queued();
        let running = Arc::ptr_eq(&inner.curr, p);
        let (old_class, old_prio) = {
            let si = p.sched.lock();
            (si.class, si.prio)
        };

        if queued {
            self.dequeue_task(rq, &mut inner, p, DEQUEUE_SAVE);
        }
        if running {
            old_class.ops().put_prev_task(&mut inner, p);
        }

        let new_class = {
            let mut si = p.sched.lock();
            si.policy = policy;
            si.rt_priority = param.sched_priority as u32;
            si.reset_on_fork = reset_on_fork;
            si.normal_prio = normal_prio(&si);
            si.prio = si.normal_prio;
            si.class = ClassId::for_prio(si.prio);
            set_load_weight(&mut si);
            si.class
        };

        if queued {
            self.enqueue_task(rq, &mut inner, p, ENQUEUE_RESTORE);
        }
        if running {
            new_class.ops().set_curr_task(&mut inner);
        }

        self.check_class_changed(rq, &mut inner, p, old_class, old_prio);
        Ok(())
    }

    /// Renice. Realtime tasks keep their effective priority; the nice
    /// value still sticks for when they return to a normal policy.
    pub fn set_user_nice(&self, p: &Arc<Task>, nice: i32) -> KernelResult<()> {
        if !(-20..=19).contains(&nice) {
            return Err(KernelError::InvalidArgument);
        }
        let lock = self.core.task_rq_lock(p);
        let _pi = lock.pi;
        let rq = lock.rq;
        let mut inner = lock.inner;
        self.update_rq_clock(&mut inner);

        if rt_policy(p.sched.lock().policy) {
            p.sched.lock().static_prio = nice_to_prio(nice);
            return Ok(());
        }

        let queued = p.on_rq_queued();
        let running = Arc::ptr_eq(&inner.curr, p);
        let (class, old_prio) = {
            let si = p.sched.lock();
            (si.class, si.prio)
        };

        if queued {
            self.dequeue_task(rq, &mut inner, p, DEQUEUE_SAVE);
        }
        if running {
            class.ops().put_prev_task(&mut inner, p);
        }
        {
            let mut si = p.sched.lock();
            si.static_prio = nice_to_prio(nice);
            si.normal_prio = normal_prio(&si);
            si.prio = si.normal_prio;
            set_load_weight(&mut si);
        }
        if queued {
            self.enqueue_task(rq, &mut inner, p, ENQUEUE_RESTORE);
        }
        if running {
            class.ops().set_curr_task(&mut inner);
        }

        if class.ops().prio_changed(&mut inner, p, old_prio) {
            self.resched_curr(rq, &inner);
        }
        Ok(())
    }

    fn check_class_changed(
        &self,
        rq: &RunQueue,
        inner: &mut RqInner,
        p: &Arc<Task>,
        old_class: ClassId,
        old_prio: i32,
    ) {
        let (new_class, new_prio) = {
            let si = p.sched.lock();
            (si.class, si.prio)
        };
        let resched = if new_class != old_class {
            old_class.ops().switched_from(inner, p);
            new_class.ops().switched_to(inner, p)
        } else if new_prio != old_prio {
            new_class.ops().prio_changed(inner, p, old_prio)
        } else {
            false
        };
        if resched {
            self.resched_curr(rq, inner);
        }
    }

    fn spin_until<F: Fn() -> bool>(&self, cond: F) {
        let mut spins = 0u32;
        while !cond() {
            if spins < SPIN_BUDGET {
                core::hint::spin_loop();
                spins += 1;
            } else {
                self.arch.cpu_relax();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RR_TIMESLICE;
    use crate::task::{SCHED_FIFO, SCHED_RR, TASK_INTERRUPTIBLE};
    use crate::testutil::MockArch;

    fn sched1() -> Scheduler<MockArch> {
        Scheduler::new(MockArch::new(), 1)
    }

    fn sched2() -> Scheduler<MockArch> {
        Scheduler::new(MockArch::new(), 2)
    }

    fn spawn(sched: &Scheduler<MockArch>, comm: &str) -> Arc<Task> {
        sched.create_task(comm, None, None, 0).unwrap()
    }

    fn spawn_queued(sched: &Scheduler<MockArch>, comm: &str) -> Arc<Task> {
        let t = spawn(sched, comm);
        sched.wake_up_new_task(&t);
        t
    }

    fn spawn_running(sched: &Scheduler<MockArch>, comm: &str) -> Arc<Task> {
        let t = spawn_queued(sched, comm);
        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, t.pid);
        t
    }

    fn spawn_rt(sched: &Scheduler<MockArch>, comm: &str, policy: i32, prio: i32) -> Arc<Task> {
        let t = spawn(sched, comm);
        sched
            .sched_setscheduler(&t, policy, &SchedParam { sched_priority: prio })
            .unwrap();
        sched.wake_up_new_task(&t);
        t
    }

    #[test]
    fn test_new_scheduler_runs_idle_everywhere() {
        let sched = sched2();
        assert_eq!(sched.core.nr_cpus(), 2);
        assert_eq!(sched.core.online_mask(), 0b11);
        for cpu in 0..2 {
            let curr = sched.core.current_task(cpu);
            assert!(curr.is_idle());
            assert_eq!(sched.core.rq(cpu).queued_load(), 0);
        }
    }

    #[test]
    fn test_fork_inherits_identity() {
        let sched = sched2();
        let parent = spawn(&sched, "svc");
        sched
            .sched_setscheduler(&parent, SCHED_FIFO, &SchedParam { sched_priority: 30 })
            .unwrap();
        let child = sched
            .create_task("svc-child", None, Some(&parent), 0)
            .unwrap();
        {
            let si = child.sched.lock();
            assert_eq!(si.policy, SCHED_FIFO);
            assert_eq!(si.prio, MAX_RT_PRIO - 1 - 30);
            assert_eq!(si.class, ClassId::RealTime);
        }

        // The reset flag downgrades the child once and does not stick.
        let flagged = spawn(&sched, "svc-reset");
        sched
            .sched_setscheduler(
                &flagged,
                SCHED_FIFO | SCHED_RESET_ON_FORK,
                &SchedParam { sched_priority: 30 },
            )
            .unwrap();
        let child = sched
            .create_task("svc-plain", None, Some(&flagged), 0)
            .unwrap();
        let si = child.sched.lock();
        assert_eq!(si.policy, SCHED_NORMAL);
        assert_eq!(si.static_prio, nice_to_prio(0));
        assert_eq!(si.prio, nice_to_prio(0));
        assert_eq!(si.class, ClassId::Fair);
        assert!(!si.reset_on_fork);
    }

    #[test]
    fn test_wake_up_new_task_preempts_idle() {
        let sched = sched2();
        let t = spawn(&sched, "worker");
        sched.wake_up_new_task(&t);
        assert!(t.on_rq_queued());
        assert_eq!(t.cpu.load(Ordering::Relaxed), 0);
        assert!(sched.core.idle_task(0).need_resched());

        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, t.pid);
        assert_eq!(t.task_state(), TASK_RUNNING);
        assert!(t.on_cpu.load(Ordering::Relaxed));
    }

    #[test]
    fn test_rt_runs_before_fair() {
        let sched = sched1();
        let fair = spawn_queued(&sched, "fair");
        let rt = spawn_rt(&sched, "rt", SCHED_FIFO, 10);

        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, rt.pid);
        assert!(fair.on_rq_queued());
    }

    #[test]
    fn test_rt_priority_then_fifo_order() {
        let sched = sched1();
        let a = spawn_rt(&sched, "a", SCHED_FIFO, 10);
        let b = spawn_rt(&sched, "b", SCHED_FIFO, 10);
        let c = spawn_rt(&sched, "c", SCHED_FIFO, 50);

        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, c.pid);

        c.set_state(TASK_INTERRUPTIBLE);
        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, a.pid);

        a.set_state(TASK_INTERRUPTIBLE);
        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, b.pid);
    }

    #[test]
    fn test_rr_slice_rotation() {
        let sched = sched1();
        let a = spawn_rt(&sched, "rr-a", SCHED_RR, 10);
        let b = spawn_rt(&sched, "rr-b", SCHED_RR, 10);

        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, a.pid);

        for _ in 0..RR_TIMESLICE {
            sched.scheduler_tick(0);
        }
        assert!(a.need_resched());
        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, b.pid);

        for _ in 0..RR_TIMESLICE {
            sched.scheduler_tick(0);
        }
        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, a.pid);
    }

    #[test]
    fn test_fair_runs_lowest_vruntime_first() {
        let sched = sched1();
        let slow = spawn(&sched, "slow");
        slow.sched.lock().se.vruntime = 5_000_000;
        let eager = spawn(&sched, "eager");
        eager.sched.lock().se.vruntime = 1_000_000;

        sched.wake_up_new_task(&slow);
        sched.wake_up_new_task(&eager);
        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, eager.pid);
    }

    #[test]
    fn test_fair_tick_preemption_after_ideal_slice() {
        let sched = sched1();
        let a = spawn_running(&sched, "a");
        let b = spawn_queued(&sched, "b");
        assert!(!a.need_resched());

        sched.arch.advance(4_000_000);
        sched.scheduler_tick(0);
        assert!(a.need_resched());

        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, b.pid);
        assert!(a.on_rq_queued());
    }

    #[test]
    fn test_fair_wakeup_preemption_needs_granularity() {
        let sched = sched1();
        let a = spawn_running(&sched, "a");
        let _b = spawn_queued(&sched, "b");

        // An equal-vruntime wakeup is within the granularity: no preempt.
        let _c = spawn_queued(&sched, "c");
        assert!(!a.need_resched());

        // Let the running task pull far ahead of the queue floor.
        sched.arch.advance(10_000_000);
        let _d = spawn_queued(&sched, "d");
        assert!(a.need_resched());
    }

    #[test]
    fn test_sleeping_task_leaves_queue_and_returns() {
        let sched = sched1();
        let t = spawn_running(&sched, "sleeper");

        t.set_state(TASK_INTERRUPTIBLE);
        sched.schedule(0);
        assert!(sched.core.current_task(0).is_idle());
        assert!(!t.on_rq_queued());
        assert_eq!(sched.core.rq(0).queued_load(), 0);

        assert!(sched.wake_up_process(&t));
        assert!(t.on_rq_queued());
        assert_eq!(t.task_state(), TASK_RUNNING);
        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, t.pid);
        assert_eq!(sched.core.rq(0).lock().nr_switches, 3);
    }

    #[test]
    fn test_nr_uninterruptible_pairs_increment_with_decrement() {
        let sched = sched1();
        let t = spawn_running(&sched, "blocked");

        t.set_state(TASK_UNINTERRUPTIBLE);
        sched.schedule(0);
        assert_eq!(sched.core.nr_uninterruptible(), 1);

        assert!(sched.wake_up_state(&t, TASK_UNINTERRUPTIBLE));
        assert_eq!(sched.core.nr_uninterruptible(), 0);
    }

    #[test]
    fn test_wake_up_state_respects_mask() {
        let sched = sched1();
        let t = spawn_running(&sched, "picky");
        t.set_state(TASK_INTERRUPTIBLE);
        sched.schedule(0);

        assert!(!sched.wake_up_state(&t, TASK_UNINTERRUPTIBLE));
        assert!(!t.on_rq_queued());
        assert!(sched.wake_up_process(&t));
        assert!(t.on_rq_queued());
    }

    #[test]
    fn test_wakeup_of_still_queued_task_is_state_flip() {
        let sched = sched1();
        let _a = spawn_running(&sched, "a");
        let b = spawn_queued(&sched, "b");

        b.set_state(TASK_INTERRUPTIBLE);
        let before = sched.core.rq(0).queued_load();
        assert!(sched.wake_up_process(&b));
        assert_eq!(sched.core.rq(0).queued_load(), before);
        assert_eq!(b.task_state(), TASK_RUNNING);
    }

    #[test]
    fn test_preempted_task_stays_queued() {
        let sched = sched1();
        let t = spawn_running(&sched, "t");

        t.set_state(TASK_INTERRUPTIBLE);
        sched.preempt_schedule(0);
        // Involuntary switch: the sleep mark does not dequeue it, and as
        // the only runnable entity it comes right back.
        assert!(t.on_rq_queued());
        assert_eq!(sched.core.current_task(0).pid, t.pid);
        t.set_state(TASK_RUNNING);
    }

    #[test]
    fn test_sched_setaffinity_validates() {
        let sched = sched2();
        assert_eq!(sched.sched_setaffinity(999, 0b1), Err(KernelError::NoProcess));

        let t = spawn_queued(&sched, "t");
        t.flags.fetch_or(PF_NO_SETAFFINITY, Ordering::Relaxed);
        assert_eq!(
            sched.sched_setaffinity(t.pid, 0b10),
            Err(KernelError::InvalidArgument)
        );
        t.flags.fetch_and(!PF_NO_SETAFFINITY, Ordering::Relaxed);

        sched.core.set_cpu_online(1, false);
        assert_eq!(
            sched.sched_setaffinity(t.pid, 0b10),
            Err(KernelError::InvalidArgument)
        );
        sched.core.set_cpu_online(1, true);
        assert!(sched.sched_setaffinity(t.pid, 0b10).is_ok());
    }

    #[test]
    fn test_affinity_change_moves_queued_task() {
        let sched = sched2();
        let t = spawn_queued(&sched, "roamer");
        assert_eq!(t.cpu.load(Ordering::Relaxed), 0);

        sched.sched_setaffinity(t.pid, 0b10).unwrap();
        assert_eq!(t.cpu.load(Ordering::Relaxed), 1);
        assert!(t.on_rq_queued());
        assert_eq!(sched.core.rq(0).queued_load(), 0);
        assert_eq!(sched.core.rq(1).queued_load(), 1);

        sched.schedule(1);
        assert_eq!(sched.core.current_task(1).pid, t.pid);
    }

    #[test]
    fn test_affinity_change_migrates_running_task() {
        let sched = Arc::new(sched2());
        let t = spawn_running(&sched, "mover");

        let requester = sched.clone();
        let target = t.clone();
        let changer = std::thread::spawn(move || {
            requester.set_cpus_allowed_ptr(&target, 0b10).unwrap();
        });

        // The running task can only move at its own scheduling point.
        while !sched.core.rq(0).stop.pending() {
            std::thread::yield_now();
        }
        sched.schedule(0);
        changer.join().unwrap();

        assert_eq!(t.cpu.load(Ordering::Relaxed), 1);
        assert!(t.on_rq_queued());
        assert!(sched.core.current_task(0).is_idle());
        sched.schedule(1);
        assert_eq!(sched.core.current_task(1).pid, t.pid);
    }

    #[test]
    fn test_migration_to_offline_cpu_aborts() {
        let sched = sched2();
        let t = spawn_queued(&sched, "stuck");

        let done = Arc::new(StopDone::new());
        sched.core.rq(0).stop.push(StopWork {
            task: t.clone(),
            dest_cpu: 1,
            done: done.clone(),
        });
        sched.core.set_cpu_online(1, false);
        sched.schedule(0);

        assert!(done.is_complete());
        assert_eq!(t.cpu.load(Ordering::Relaxed), 0);
        assert!(t.on_rq_queued());
        assert_eq!(sched.core.rq(0).queued_load(), 1);
        sched.core.set_cpu_online(1, true);
    }

    #[test]
    fn test_setscheduler_moves_between_classes() {
        let sched = sched1();
        let t = spawn_running(&sched, "shift");
        assert_eq!(t.sched.lock().class, ClassId::Fair);

        sched
            .sched_setscheduler(&t, SCHED_FIFO, &SchedParam { sched_priority: 50 })
            .unwrap();
        {
            let si = t.sched.lock();
            assert_eq!(si.class, ClassId::RealTime);
            assert_eq!(si.prio, MAX_RT_PRIO - 1 - 50);
        }
        assert_eq!(sched.core.current_task(0).pid, t.pid);

        sched
            .sched_setscheduler(&t, SCHED_NORMAL, &SchedParam { sched_priority: 0 })
            .unwrap();
        assert_eq!(t.sched.lock().class, ClassId::Fair);

        // A realtime waiter now outranks the demoted current task.
        let rt = spawn_rt(&sched, "rt", SCHED_FIFO, 10);
        assert!(t.need_resched());
        sched.schedule(0);
        assert_eq!(sched.core.current_task(0).pid, rt.pid);
        assert!(t.on_rq_queued());
    }

    #[test]
    fn test_setscheduler_rejects_bad_params() {
        let sched = sched1();
        let t = spawn(&sched, "t");
        let prio = |p: i32| SchedParam { sched_priority: p };

        assert!(sched.sched_setscheduler(&t, 7, &prio(0)).is_err());
        assert!(sched.sched_setscheduler(&t, SCHED_FIFO, &prio(0)).is_err());
        assert!(sched.sched_setscheduler(&t, SCHED_FIFO, &prio(100)).is_err());
        assert!(sched.sched_setscheduler(&t, SCHED_NORMAL, &prio(3)).is_err());

        let idle = sched.core.idle_task(0);
        assert_eq!(
            sched.sched_setscheduler(&idle, SCHED_FIFO, &prio(10)),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_set_user_nice_updates_weight() {
        let sched = sched1();
        let t = spawn(&sched, "nice");

        sched.set_user_nice(&t, 10).unwrap();
        {
            let si = t.sched.lock();
            assert_eq!(si.static_prio, nice_to_prio(10));
            assert_eq!(si.prio, nice_to_prio(10));
            assert_eq!(si.se.load_weight, SCHED_PRIO_TO_WEIGHT[30]);
        }
        assert!(sched.set_user_nice(&t, -21).is_err());

        // Renice of a realtime task touches the stored nice only.
        sched
            .sched_setscheduler(&t, SCHED_FIFO, &SchedParam { sched_priority: 5 })
            .unwrap();
        sched.set_user_nice(&t, -10).unwrap();
        let si = t.sched.lock();
        assert_eq!(si.static_prio, nice_to_prio(-10));
        assert_eq!(si.prio, MAX_RT_PRIO - 1 - 5);
    }

    #[test]
    fn test_dead_task_leaves_directory() {
        let sched = sched1();
        let t = spawn_running(&sched, "doomed");
        let pid = t.pid;
        assert!(sched.core.task_by_pid(pid).is_some());

        sched.do_task_dead(0);
        assert!(sched.core.current_task(0).is_idle());
        assert!(sched.core.task_by_pid(pid).is_none());
        assert_eq!(sched.core.rq(0).queued_load(), 0);
    }

    #[test]
    fn test_fallback_placement_resets_affinity() {
        let sched = sched2();
        let t = spawn(&sched, "pin");
        sched.set_cpus_allowed_ptr(&t, 0b10).unwrap();

        sched.core.set_cpu_online(1, false);
        sched.wake_up_new_task(&t);
        assert_eq!(t.cpu.load(Ordering::Relaxed), 0);
        assert!(t.on_rq_queued());
        assert_eq!(t.sched.lock().cpus_allowed, CPU_MASK_ALL);
        sched.core.set_cpu_online(1, true);
    }

    #[test]
    fn test_tick_advances_task_clock() {
        let sched = sched1();
        let t = spawn_running(&sched, "clocked");

        sched.arch.advance(2_000_000);
        sched.scheduler_tick(0);
        {
            let si = t.sched.lock();
            assert_eq!(si.se.sum_exec_runtime, 2_000_000);
            // Nice 0: virtual time advances at wall speed.
            assert_eq!(si.se.vruntime, 2_000_000);
        }
        assert_eq!(sched.core.rq(0).lock().clock_task, 2_000_000);
    }
}

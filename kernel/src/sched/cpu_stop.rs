//! Per-CPU stop works.
//!
//! A stop work asks one CPU to run a short, non-preemptible action, here
//! always "push this task to another run queue". Works queue into the
//! target CPU's inbox; the pending mark makes the next pick on that CPU
//! choose the stopper task, which drains the inbox at the scheduling
//! point and completes each work.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::task::Task;

/// Completion token the queuer spins on.
pub struct StopDone {
    completed: AtomicBool,
}

impl StopDone {
    pub fn new() -> Self {
        StopDone {
            completed: AtomicBool::new(false),
        }
    }

    pub fn complete(&self) {
        self.completed.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl Default for StopDone {
    fn default() -> Self {
        Self::new()
    }
}

/// One queued migration: move `task` to `dest_cpu` if it is still queued
/// on the executing CPU when the work runs.
pub struct StopWork {
    pub task: Arc<Task>,
    pub dest_cpu: u32,
    pub done: Arc<StopDone>,
}

/// Stop-work inbox of one CPU.
pub struct CpuStopQueue {
    works: Mutex<VecDeque<StopWork>>,
    pending: AtomicBool,
}

impl CpuStopQueue {
    pub fn new() -> Self {
        CpuStopQueue {
            works: Mutex::new(VecDeque::new()),
            pending: AtomicBool::new(false),
        }
    }

    pub fn push(&self, work: StopWork) {
        self.works.lock().push_back(work);
        self.pending.store(true, Ordering::Release);
    }

    pub fn pop(&self) -> Option<StopWork> {
        self.works.lock().pop_front()
    }

    /// Whether the next pick must choose the stopper.
    pub fn pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Drop the pending mark unless new work arrived mid-drain.
    pub fn finish_round(&self) {
        let works = self.works.lock();
        if works.is_empty() {
            self.pending.store(false, Ordering::Release);
        }
    }
}

impl Default for CpuStopQueue {
    fn default() -> Self {
        Self::new()
    }
}

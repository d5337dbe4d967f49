//! splitkern: scheduler and remote-memory core of a disaggregated kernel.
//!
//! A disaggregated deployment splits one logical machine across dedicated
//! processor and memory nodes. This crate carries the two pieces that make
//! the split work: the per-node CPU scheduler (run queues, scheduling
//! classes, wakeups, affinity and cross-CPU migration) and the memory-node
//! virtual memory engine that resolves page faults on behalf of remote
//! processors (the VMA index, software-walked page tables mapping process
//! addresses to kernel pages, and the handlers for cache-miss and flush
//! traffic).
//!
//! Hardware and off-node services stay behind the traits in [`services`]:
//! clock/IPI/context plumbing for the scheduler, page frames, storage reads,
//! and the reply transport for the memory node.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod cpumask;
pub mod error;
pub mod mm;
pub mod rpc;
pub mod sched;
pub mod services;
pub mod task;

#[cfg(test)]
mod testutil;

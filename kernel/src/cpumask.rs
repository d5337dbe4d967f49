//! CPU affinity masks.
//!
//! A mask is a single machine word with bit N standing for CPU N, which
//! caps the node at [`MAX_CPUS`] CPUs and keeps every mask operation a
//! plain integer op.

use crate::config::MAX_CPUS;

/// Bitmask of CPUs; bit N is CPU N.
pub type CpuMask = u64;

/// Mask with every possible CPU set.
pub const CPU_MASK_ALL: CpuMask = !0;

/// Mask containing only `cpu`.
#[inline]
pub fn cpumask_of(cpu: u32) -> CpuMask {
    1u64 << cpu
}

/// Whether `cpu` is set in `mask`.
#[inline]
pub fn cpumask_test(mask: CpuMask, cpu: u32) -> bool {
    mask & (1u64 << cpu) != 0
}

/// Number of CPUs set in `mask`.
#[inline]
pub fn cpumask_weight(mask: CpuMask) -> u32 {
    mask.count_ones()
}

/// Lowest CPU set in `mask`, if any.
#[inline]
pub fn cpumask_first(mask: CpuMask) -> Option<u32> {
    if mask == 0 {
        None
    } else {
        Some(mask.trailing_zeros())
    }
}

/// Lowest CPU set in both masks, if any.
#[inline]
pub fn cpumask_first_and(a: CpuMask, b: CpuMask) -> Option<u32> {
    cpumask_first(a & b)
}

/// Whether the two masks share at least one CPU.
#[inline]
pub fn cpumask_intersects(a: CpuMask, b: CpuMask) -> bool {
    a & b != 0
}

/// Iterate the CPUs set in `mask`, lowest first.
pub fn cpumask_iter(mask: CpuMask) -> impl Iterator<Item = u32> {
    (0..MAX_CPUS as u32).filter(move |cpu| cpumask_test(mask, *cpu))
}

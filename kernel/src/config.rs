//! Node-wide constants and runtime tunables.
//!
//! The constants mirror what the platform would fix in board headers; the
//! runtime knobs travel in [`MemConfig`], handed to the memory node at
//! construction instead of living in globals.

use crate::error::{KernelError, KernelResult};

/// Base-2 log of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask selecting the page-aligned part of an address.
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Highest user virtual address, exclusive. 47-bit user space minus one
/// guard page, the x86-64 layout.
pub const TASK_SIZE_MAX: u64 = (1u64 << 47) - PAGE_SIZE;

/// Remote cache line carried by miss and flush traffic. The processor-side
/// cache is page-grained, so a line is a whole page.
pub const CACHELINE_SIZE: u64 = PAGE_SIZE;

/// Most CPUs a node can carry; affinity masks are one u64 wide.
pub const MAX_CPUS: usize = 64;

/// Gap preserved between a grows-down region and its lower neighbor.
pub const STACK_GUARD_GAP: u64 = 256 * 1024;

/// Default per-address-space stack ceiling (RLIMIT_STACK default).
pub const DEFAULT_STACK_RLIMIT: u64 = 8 * 1024 * 1024;

/// Round-robin timeslice in scheduler ticks.
pub const RR_TIMESLICE: u32 = 100;

/// Runtime tuning for one memory node.
#[derive(Debug, Clone, Copy)]
pub struct MemConfig {
    /// Divisor of [`PAGE_SIZE`] giving the miss-reply payload length.
    pub fill_split: u32,
    /// Pages fetched per bulk fault window. Power of two; 0 disables
    /// prefetching entirely.
    pub prefetch_pages: u32,
}

impl MemConfig {
    /// Bytes returned per miss reply.
    #[inline]
    pub fn fill_len(&self) -> usize {
        (PAGE_SIZE / self.fill_split as u64) as usize
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.fill_split == 0 || PAGE_SIZE % self.fill_split as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if self.prefetch_pages != 0 && !self.prefetch_pages.is_power_of_two() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for MemConfig {
    fn default() -> Self {
        MemConfig {
            fill_split: 1,
            prefetch_pages: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memconfig_validation() {
        assert!(MemConfig::default().validate().is_ok());
        assert!(MemConfig { fill_split: 8, prefetch_pages: 4 }.validate().is_ok());

        let bad_split = MemConfig { fill_split: 3, prefetch_pages: 0 };
        assert_eq!(bad_split.validate(), Err(KernelError::InvalidArgument));

        let bad_prefetch = MemConfig { fill_split: 1, prefetch_pages: 5 };
        assert_eq!(bad_prefetch.validate(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_fill_len() {
        assert_eq!(MemConfig::default().fill_len(), PAGE_SIZE as usize);
        let quarter = MemConfig { fill_split: 4, prefetch_pages: 0 };
        assert_eq!(quarter.fill_len(), 1024);
    }
}

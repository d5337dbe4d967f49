//! Unified kernel error type
//!
//! KernelError uses `#[repr(i32)]` with discriminants equal to errno values.
//! This eliminates all error translation - the discriminant IS the errno.

/// Kernel error type with errno values as discriminants
///
/// Miss replies carry the positive value, flush replies the negated one,
/// so both directions come straight off the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelError {
    /// Operation not permitted (EPERM)
    NotPermitted = 1,
    /// No such process (ESRCH)
    NoProcess = 3,
    /// I/O error (EIO)
    Io = 5,
    /// Resource temporarily unavailable (EAGAIN)
    WouldBlock = 11,
    /// Out of memory (ENOMEM)
    OutOfMemory = 12,
    /// Bad address (EFAULT)
    BadAddress = 14,
    /// Device or resource busy (EBUSY)
    Busy = 16,
    /// File exists (EEXIST)
    AlreadyExists = 17,
    /// Invalid argument (EINVAL)
    InvalidArgument = 22,
}

impl KernelError {
    /// Convert to negative errno form
    #[inline]
    pub const fn to_errno_neg(self) -> i32 {
        -(self as i32)
    }

    /// Get the positive errno value
    #[inline]
    pub const fn errno(self) -> i32 {
        self as i32
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

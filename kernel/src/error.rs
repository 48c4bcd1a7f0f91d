//! Kernel error types.
//!
//! Recoverable failures are reported through [`KernelError`] and bubble up
//! to the caller of fork/growproc/kill, which decides what to do. Lock- and
//! state-machine invariant violations are *not* errors: they indicate
//! corrupted accounting and abort via `panic!` at the point of detection.

use core::fmt;

/// Recoverable kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No free slot in the process table.
    ProcessLimitReached,
    /// Physical frame or address-space allocation failed.
    OutOfMemory,
    /// Growth would push the process past its total-page cap.
    SizeLimitExceeded,
    /// Page-table walk failed for the given virtual address.
    WalkFailed,
    /// Backing-store I/O failed.
    Io,
    /// No free descriptor slot in the target process.
    TooManyFiles,
    /// The caller has no children to wait for, or was killed while
    /// waiting.
    NoChildren,
    /// No live process carries the requested pid.
    NoSuchProcess,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessLimitReached => write!(f, "process table full"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::SizeLimitExceeded => write!(f, "total page limit exceeded"),
            Self::WalkFailed => write!(f, "page table walk failed"),
            Self::Io => write!(f, "backing store I/O error"),
            Self::TooManyFiles => write!(f, "descriptor table full"),
            Self::NoChildren => write!(f, "no children"),
            Self::NoSuchProcess => write!(f, "no such process"),
        }
    }
}

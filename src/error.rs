//! Typed errors for the core.
//!
//! Per the error-handling design: resource exhaustion, bad user pointers,
//! and lookup failures are values propagated to the caller; invariant
//! violations are `panic!`s and never appear here.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("no free process slot")]
    NoFreeSlot,

    #[error("out of memory")]
    OutOfMemory,

    #[error("copyout to user address failed")]
    CopyOutFailed,

    #[error("no such process")]
    NoSuchProcess,

    #[error("process has no children")]
    NoChildren,

    #[error("interrupted by a pending kill while waiting")]
    Interrupted,
}

impl KernelError {
    /// Bridges to the original xv6 convention of returning `-1` on failure.
    pub fn into_syscall_errno(self) -> i32 {
        -1
    }
}

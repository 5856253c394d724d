//! System Call Interface
//!
//! Errno-coded errors shared by the kernel's system call surface, and the
//! `select` shim built on top of the poll primitive.
//!
//! # Security Model
//! - All parameters are validated before use
//! - Invalid inputs return errors, never panic

pub mod select;

use core::fmt;

use crate::mm::HeapError;

/// System call error codes
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Interrupted before completion
    Eintr = -4,
    /// Bad file descriptor
    Ebadf = -9,
    /// Try again (resource busy)
    Eagain = -11,
    /// Out of memory
    Enomem = -12,
    /// Bad address (invalid pointer)
    Efault = -14,
    /// Invalid argument
    Einval = -22,
}

impl SyscallError {
    /// Value placed in the return register.
    #[inline]
    pub fn errno(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Eintr => "EINTR",
            Self::Ebadf => "EBADF",
            Self::Eagain => "EAGAIN",
            Self::Enomem => "ENOMEM",
            Self::Efault => "EFAULT",
            Self::Einval => "EINVAL",
        };
        write!(f, "{} ({})", name, self.errno())
    }
}

impl From<HeapError> for SyscallError {
    fn from(err: HeapError) -> Self {
        match err {
            HeapError::ZeroSize => Self::Einval,
            HeapError::OutOfMemory { .. } | HeapError::Corrupted { .. } => Self::Enomem,
            HeapError::InvalidPointer | HeapError::DoubleFree => Self::Efault,
            HeapError::WouldBlock => Self::Eagain,
        }
    }
}

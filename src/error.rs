//! Recoverable failures of the synchronization primitives.
//!
//! Misuse (wrong owner, blocking in an interrupt handler, destroying a
//! primitive that still has sleepers) is not represented here: it panics.

use core::fmt;

/// Status code reported for [`SyncError::NoMemory`].
pub const ENOMEM: isize = -12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// The primitive's name or internal storage could not be allocated.
    NoMemory,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Negative status in the style of the syscall layer.
    pub fn code(self) -> isize {
        match self {
            SyncError::NoMemory => ENOMEM,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::NoMemory => f.write_str("out of memory"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SyncError {}

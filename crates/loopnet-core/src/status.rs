//! Read outcomes and write completion status codes.
//!
//! These are the *lingua franca* between the driver, the loop dispatcher,
//! and the connection layer. OS error codes travel through them verbatim
//! (positive errno values), so a completion callback can log exactly what
//! the kernel reported.

use bytes::Bytes;

/// Result of one armed read, delivered together with the buffer the
/// allocation phase produced for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes landed at the front of the buffer, n > 0.
    Data(usize),
    /// Readiness fired but nothing was readable (EAGAIN / spurious wake).
    /// Not an error; the buffer is simply dropped.
    Empty,
    /// Orderly end-of-stream: the peer finished writing.
    Eof,
    /// Transport error with the raw errno.
    Err(i32),
}

/// Status surfaced to a write completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every byte was handed to the OS.
    Success,
    /// Library-level rejection: the connection was already marked
    /// disconnected, so the write never reached the driver.
    Disconnected,
    /// The connection was closed while the write was still queued.
    Canceled,
    /// The OS reported an error during the write (raw errno).
    Os(i32),
}

impl WriteStatus {
    /// Map a driver-level result code (0 or positive errno) to a status.
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            Self::Success
        } else {
            Self::Os(code)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Completion record for one write: the exact bytes that were submitted,
/// handed back to the caller, plus the outcome.
pub struct WriteInfo {
    pub buf: Bytes,
    pub status: WriteStatus,
}

//! Read buffer for the two-phase allocate/deliver protocol.
//!
//! Before each read the driver asks the sink to allocate a buffer sized to
//! the driver's suggestion (phase 1). The driver fills it and hands it back
//! together with a `ReadOutcome` (phase 2). Ownership moves with the buffer:
//! the delivery call consumes it, so it is released on every branch —
//! including the empty and error branches — without any manual bookkeeping.

/// Default allocation size for one read, matching the usual reactor
/// suggestion of 64 KiB.
pub const SUGGESTED_READ_SIZE: usize = 64 * 1024;

/// A heap buffer that lives for exactly one read notification.
#[derive(Debug)]
pub struct ReadBuf {
    data: Vec<u8>,
}

impl ReadBuf {
    /// Allocate a zeroed buffer of `suggested` bytes.
    pub fn with_capacity(suggested: usize) -> Self {
        Self {
            data: vec![0u8; suggested],
        }
    }

    /// Total buffer size in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The filled prefix after a read of `n` bytes.
    ///
    /// Callers must pass an `n` no larger than `capacity()`.
    pub fn filled(&self, n: usize) -> &[u8] {
        &self.data[..n]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

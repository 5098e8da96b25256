//! Stream driver abstraction — the reactor boundary.
//!
//! A `StreamDriver` owns the readiness machinery for a set of stream fds:
//! it arms reads, queues writes, performs shutdown and close requests, and
//! reports everything back as `Completion` values through `poll()`.
//!
//! # Implementors
//!
//! - `PollDriver` (default, in `loopnet-reactor`): `libc::poll` over
//!   non-blocking fds. Safe, portable, works everywhere POSIX poll exists.
//!
//! - An epoll or io_uring backend can replace it without touching the
//!   connection layer; only this trait stands between them.
//!
//! **Contract:**
//! - Submit-type methods (`submit_write`, `shutdown`, `close`, ...) never
//!   block and never invoke user callbacks inline. Every user-visible
//!   completion is emitted through `poll()`, exactly once.
//! - The caller (the event loop) invokes all methods from a single thread.
//! - The driver never closes an fd; fd lifetime belongs to whoever
//!   registered it.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::buffer::ReadBuf;
use crate::callback::{AfterWrite, CloseCallback, ShutdownCallback};
use crate::error::Result;
use crate::event::Completion;
use crate::status::ReadOutcome;

/// Consumer side of the two-phase read protocol.
///
/// Phase 1: the driver calls `alloc` with its size suggestion before each
/// read. Phase 2: the driver hands the filled buffer back to `deliver`
/// along with the outcome. The buffer is consumed by delivery — it is
/// freed on every branch by moving it here.
///
/// `alloc` must not call back into the loop or the driver; it runs while
/// the driver is mid-poll.
pub trait ReadSink: Send + Sync {
    /// Allocation phase. The default is a fresh heap buffer of the
    /// suggested size.
    fn alloc(&self, suggested: usize) -> ReadBuf {
        ReadBuf::with_capacity(suggested)
    }

    /// Delivery phase. Called once per read notification, off the driver
    /// borrow, so the sink may freely submit writes, shutdowns, or closes.
    fn deliver(&self, buf: ReadBuf, outcome: ReadOutcome);
}

/// Readiness notification for a listening socket. The sink drains
/// `accept` itself until it would block.
pub trait AcceptSink: Send + Sync {
    fn incoming(&self);
}

/// Async stream submission and completion.
pub trait StreamDriver: Send {
    /// Watch an eventfd-style wake descriptor. Readability on it
    /// interrupts `poll` and is drained internally, producing no event.
    fn watch_wake(&mut self, fd: RawFd) -> Result<()>;

    /// Register a stream fd and switch it to non-blocking mode.
    fn register(&mut self, fd: RawFd) -> Result<()>;

    /// Arm read notifications. The driver holds the sink (shared) until
    /// `read_stop`, end-of-stream, a read error, or `close` disarms it.
    fn read_start(&mut self, fd: RawFd, sink: Arc<dyn ReadSink>) -> Result<()>;

    /// Disarm read notifications. No-op if reads are not armed.
    fn read_stop(&mut self, fd: RawFd);

    /// Whether read notifications are currently armed for `fd`.
    fn is_read_active(&self, fd: RawFd) -> bool;

    /// Whether `fd` is closing or already forgotten. Once true, a second
    /// close request must not be issued — re-issuing corrupts the
    /// driver's bookkeeping.
    fn is_closing(&self, fd: RawFd) -> bool;

    /// Queue a write. Writes to the same fd complete in submission order;
    /// partial writes are continued transparently. A write submitted to a
    /// closing or unknown fd completes with `WriteStatus::Canceled`.
    fn submit_write(&mut self, fd: RawFd, buf: Bytes, cb: Option<AfterWrite>);

    /// Request a graceful outbound shutdown (`SHUT_WR`) once all queued
    /// writes have drained.
    fn shutdown(&mut self, fd: RawFd, cb: ShutdownCallback);

    /// Forget the fd: disarm reads, cancel queued writes, and emit
    /// `CloseDone` on the next poll. Always asynchronous; idempotence is
    /// the caller's job via `is_closing`.
    fn close(&mut self, fd: RawFd, cb: CloseCallback);

    /// Arm accept notifications for a listening fd.
    fn listen_start(&mut self, fd: RawFd, sink: Arc<dyn AcceptSink>) -> Result<()>;

    /// Wait up to `timeout` for readiness, perform the actual I/O, and
    /// append resulting completions to `out`. Returns how many were
    /// appended. Returns immediately if completions are already pending.
    fn poll(&mut self, out: &mut Vec<Completion>, timeout: Option<Duration>) -> Result<usize>;
}

//! Completion events emitted by a driver's `poll`.
//!
//! The loop dispatches these after releasing its borrow of the driver,
//! which is what lets a callback re-enter the driver (a message handler
//! answering with a write, an EOF branch issuing a shutdown) without
//! aliasing it.

use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::ReadBuf;
use crate::callback::{AfterWrite, CloseCallback, ShutdownCallback};
use crate::driver::{AcceptSink, ReadSink};
use crate::status::{ReadOutcome, WriteStatus};

pub enum Completion {
    /// One read notification: the buffer from the allocation phase plus
    /// its outcome, addressed to the sink that allocated it.
    Read {
        sink: Arc<dyn ReadSink>,
        buf: ReadBuf,
        outcome: ReadOutcome,
    },
    /// A queued write finished (or was rejected); the submitted bytes
    /// ride along so the callback gets the identical buffer back.
    WriteDone {
        buf: Bytes,
        cb: Option<AfterWrite>,
        status: WriteStatus,
    },
    /// A shutdown request finished with 0 or a positive errno.
    ShutdownDone { cb: ShutdownCallback, status: i32 },
    /// A close request finished; the fd is forgotten by the driver.
    CloseDone { cb: CloseCallback },
    /// A listening fd has connections to accept.
    Incoming { sink: Arc<dyn AcceptSink> },
}

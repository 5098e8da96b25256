//! # loopnet-core — Trait definitions for the loopnet reactor
//!
//! This crate defines the boundary between the connection layer and the
//! machinery that drives it: buffer types, completion records, callback
//! aliases, and the `StreamDriver` trait that a reactor backend implements.
//!
//! ## Design principle
//!
//! > "Program to the interface. Start safe. Optimize with a new impl,
//! >  not by modifying the existing one."
//!
//! Connection code depends on traits from this crate, never on a concrete
//! backend. The default backend (`PollDriver` in `loopnet-reactor`) is a
//! portable readiness poller; swapping in an epoll or io_uring backend is
//! a matter of implementing `StreamDriver`.
//!
//! ## Threading contract
//!
//! Everything behind `StreamDriver` is mutated on exactly one thread — the
//! loop thread. Foreign threads never touch a driver; they marshal work to
//! the loop thread instead (see `loopnet-reactor::LoopHandle`). That single
//! rule is the synchronization mechanism of the whole system: no locks
//! guard the socket state, because only one thread ever reaches it.

pub mod buffer;
pub mod callback;
pub mod driver;
pub mod error;
pub mod event;
pub mod status;

pub use buffer::{ReadBuf, SUGGESTED_READ_SIZE};
pub use callback::{AfterWrite, CloseCallback, ShutdownCallback, Task};
pub use driver::{AcceptSink, ReadSink, StreamDriver};
pub use error::{LoopError, Result};
pub use event::Completion;
pub use status::{ReadOutcome, WriteInfo, WriteStatus};

//! # loopnet-reactor — the loop thread and its default driver
//!
//! One `EventLoop` owns one OS thread and one `StreamDriver`. It:
//! 1. Drains cross-thread tasks from a lock-free queue
//! 2. Polls the driver for readiness and performs the actual I/O
//! 3. Dispatches the resulting completions to their callbacks
//!
//! Foreign threads never touch the driver. They push a boxed task onto
//! the queue and ring an eventfd; the loop thread runs the task on its
//! next turn. That hand-off is the only cross-thread mechanism in the
//! system — everything that mutates a socket runs on the loop thread.

pub mod event_loop;
pub mod poll_driver;
pub mod waker;

pub use event_loop::{EventLoop, LoopHandle};
pub use poll_driver::PollDriver;
pub use waker::EventFdWaker;

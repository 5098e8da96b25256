//! Callback and task aliases.
//!
//! All of these are `Send`: a callback may be constructed on a foreign
//! thread, marshalled to the loop thread inside a task or a pending
//! request, and invoked there. Each fires at most once, so they are
//! `FnOnce` and consumed on invocation.

use crate::status::WriteInfo;

/// A unit of work marshalled onto the loop thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Per-write completion callback. Receives the submitted bytes back
/// together with the final status.
pub type AfterWrite = Box<dyn FnOnce(WriteInfo) + Send>;

/// Shutdown-request completion callback. The argument is 0 on success or
/// a positive errno.
pub type ShutdownCallback = Box<dyn FnOnce(i32) + Send>;

/// Close-request completion callback. Fires once the driver has forgotten
/// the fd; releasing the fd itself is the owner's business.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

//! # loopnet-tcp — established-connection lifecycle on the loop thread
//!
//! `TcpConnection` models one accepted TCP socket: non-blocking read
//! delivery, guarded write submission (same-thread and cross-thread), and
//! idempotent close with a shutdown handshake.
//!
//! The safety invariant of the whole crate: the socket is mutated only on
//! the thread that runs its loop. Same-thread callers go straight to the
//! driver; foreign threads go through `write_in_loop`/`close`, which
//! marshal an owning payload onto the loop. There is not a single lock
//! around socket state — the one-writer-thread rule is the
//! synchronization.
//!
//! Ownership is the other half of the story. The connection is held in an
//! `Arc`; every asynchronous closure that will touch it later (read sink,
//! shutdown completion, close completion, cross-thread payload) captures
//! its own shared handle, so the object cannot die mid-flight. The one
//! deliberate exception is the registry back-reference, which is weak —
//! a connection must never keep its own registry entry alive.

pub mod connection;
pub mod element;
pub mod error;
pub mod server;

pub use connection::{CloseComplete, ConnectionCallback, MessageCallback, TcpConnection};
pub use element::ConnectionElement;
pub use error::TcpError;
pub use server::TcpServer;

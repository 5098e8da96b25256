//! TCP-layer error type.

use loopnet_core::LoopError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TcpError {
    /// The connection is marked disconnected; the operation was rejected
    /// before reaching the driver.
    #[error("connection is disconnected")]
    Disconnected,
    /// Loop or driver failure underneath.
    #[error(transparent)]
    Loop(#[from] LoopError),
}

//! Loop and driver error types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoopError {
    /// The operation must run on the loop thread and the caller is not on it.
    #[error("not on the loop thread")]
    NotOnLoop,
    /// The loop has not started yet or has already stopped.
    #[error("loop is not running")]
    NotRunning,
    /// The fd is not registered with the driver.
    #[error("fd {0} is not registered")]
    NotRegistered(i32),
    /// OS error with errno.
    #[error("OS error: errno {0}")]
    Os(i32),
}

pub type Result<T> = std::result::Result<T, LoopError>;

//! Crate-wide error types
//!
//! Each subsystem has its own error enum (`BufferError`, `WorkerError`,
//! `TransportError`, `SendReplayError`); `ReplayError` wraps them so that
//! `ReplayContainer::handle_exception` can accept any of them.

use thiserror::Error;

use crate::buffer::BufferError;
use crate::delivery::SendReplayError;
use crate::worker::WorkerError;

/// Replay-wide error type
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Event buffer rejected or failed an operation
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Compression worker failure
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Segment could not be delivered
    #[error(transparent)]
    Send(#[from] SendReplayError),

    /// Session store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Segment refused because the replay ran past its maximum duration
    #[error("Session is too long, not sending replay")]
    SessionTooLong,

    /// Generic error with custom message
    #[error("{0}")]
    Other(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ReplayError>;

impl From<sled::Error> for ReplayError {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<ReplayError> for String {
    fn from(error: ReplayError) -> String {
        error.to_string()
    }
}

//! Error types for DriftFS
//!
//! This module defines the common error type used throughout the system.
//! Per-operation failures travel as a negative `status` code on the op
//! itself (see [`crate::status`]); `Error` covers API misuse,
//! configuration problems and I/O setup faults.

use thiserror::Error;

/// Common result type for DriftFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for DriftFS
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

//! Error types for blockput.
//!
//! This module provides the crate-wide error type used by configuration,
//! resume persistence, data sources and the HTTP transfer client. Failures of
//! a whole upload are reported separately through
//! [`UploadFailure`](crate::executor::UploadFailure), which carries the
//! classified outcome and the last persisted checkpoint.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for blockput operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for blockput.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Chunk size is not one of the supported 256 KiB multiples
    #[error("unsupported chunk size: {0} units of 256 KiB (expected 1, 2, 4, 8 or 16)")]
    InvalidChunkSize(u32),

    /// Resume store failure
    #[error("resume store error: {0}")]
    ResumeStore(String),

    /// Upload credential could not be obtained
    #[error("credential error: {0}")]
    Credential(String),

    /// HTTP transport could not be set up or used
    #[error("http error: {0}")]
    Http(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Http(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

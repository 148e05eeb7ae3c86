//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested location does not exist.
    #[error("location not found: {location}")]
    NotFound {
        /// The missing location.
        location: String,
    },

    /// Attempted to read beyond the end of a location.
    #[error("read beyond end of {location}: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The location being read.
        location: String,
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current size of the location.
        size: u64,
    },

    /// The location name cannot be mapped onto the medium.
    #[error("invalid location {location:?}: {reason}")]
    InvalidLocation {
        /// The rejected location.
        location: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A list pattern could not be compiled.
    #[error("invalid location pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Stored bytes failed an integrity check (authentication, framing).
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// Encryption could not be performed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// The backend has been disposed.
    #[error("storage backend is disposed")]
    Disposed,

    /// A long-running enumeration was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Creates a not-found error for a location.
    pub fn not_found(location: impl Into<String>) -> Self {
        Self::NotFound {
            location: location.into(),
        }
    }

    /// Creates an invalid-location error.
    pub fn invalid_location(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLocation {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Creates an integrity failure.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }
}

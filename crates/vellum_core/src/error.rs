//! Error types for Vellum core.

use std::fmt;
use std::io;
use thiserror::Error;
use vellum_storage::StorageError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse error taxonomy shared by every core operation.
///
/// Callers that only need to branch on the *kind* of failure match on this
/// instead of the full [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A named resource (collection, index, backup, location) is missing.
    NotFound,
    /// A named resource already exists.
    AlreadyExists,
    /// The operation is not legal in the current state.
    InvalidState,
    /// Stored bytes failed validation (checksum, authentication, framing).
    IntegrityFailure,
    /// Configuration is missing or malformed.
    ConfigurationError,
    /// The component has been closed or disposed.
    Disposed,
    /// An underlying I/O operation failed.
    Io,
    /// The operation was cancelled through a token.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::InvalidState => "invalid state",
            Self::IntegrityFailure => "integrity failure",
            Self::ConfigurationError => "configuration error",
            Self::Disposed => "disposed",
            Self::Io => "I/O",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in Vellum core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON metadata could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An item serializer failed.
    #[error("serialization failed: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// WAL is corrupted or invalid.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Stored data failed an integrity check.
    #[error("integrity failure: {message}")]
    Integrity {
        /// Description of the failure.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: String,
        /// Actual checksum.
        actual: String,
    },

    /// Collection not found.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Name of the collection.
        name: String,
    },

    /// Collection already exists.
    #[error("collection already exists: {name}")]
    CollectionExists {
        /// Name of the collection.
        name: String,
    },

    /// Index not found.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// Name of the index.
        name: String,
    },

    /// Index already exists.
    #[error("index already exists: {name}")]
    IndexExists {
        /// Name of the index.
        name: String,
    },

    /// Backup not found.
    #[error("backup not found: {backup_id}")]
    BackupNotFound {
        /// Identifier of the backup.
        backup_id: String,
    },

    /// Backup already exists.
    #[error("backup already exists: {backup_id}")]
    BackupExists {
        /// Identifier of the backup.
        backup_id: String,
    },

    /// Savepoint not found.
    #[error("savepoint not found: {name}")]
    SavepointNotFound {
        /// Name of the savepoint.
        name: String,
    },

    /// Savepoint name already used within the transaction.
    #[error("savepoint already exists: {name}")]
    SavepointExists {
        /// Name of the savepoint.
        name: String,
    },

    /// Transaction was aborted.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// A location this transaction rewrites was committed by someone else
    /// after the transaction read it.
    #[error("write conflict on {location}")]
    WriteConflict {
        /// The contended location.
        location: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Configuration is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Index has been disposed.
    #[error("index is disposed")]
    IndexDisposed,

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates an integrity failure.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a collection-not-found error.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    /// Creates a backup-not-found error.
    pub fn backup_not_found(backup_id: impl Into<String>) -> Self {
        Self::BackupNotFound {
            backup_id: backup_id.into(),
        }
    }

    /// Maps this error onto the coarse [`ErrorKind`] taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(e) => match e {
                StorageError::NotFound { .. } => ErrorKind::NotFound,
                StorageError::Integrity(_) | StorageError::Encryption(_) => {
                    ErrorKind::IntegrityFailure
                }
                StorageError::InvalidLocation { .. } | StorageError::InvalidPattern { .. } => {
                    ErrorKind::InvalidState
                }
                StorageError::Disposed => ErrorKind::Disposed,
                StorageError::Cancelled => ErrorKind::Cancelled,
                StorageError::Io(_) | StorageError::ReadPastEnd { .. } => ErrorKind::Io,
            },
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_)
            | Self::Serialization { .. }
            | Self::WalCorruption { .. }
            | Self::Integrity { .. }
            | Self::ChecksumMismatch { .. } => ErrorKind::IntegrityFailure,
            Self::CollectionNotFound { .. }
            | Self::IndexNotFound { .. }
            | Self::BackupNotFound { .. }
            | Self::SavepointNotFound { .. } => ErrorKind::NotFound,
            Self::CollectionExists { .. }
            | Self::IndexExists { .. }
            | Self::BackupExists { .. }
            | Self::SavepointExists { .. } => ErrorKind::AlreadyExists,
            Self::TransactionAborted { .. }
            | Self::InvalidOperation { .. }
            | Self::WriteConflict { .. }
            | Self::DatabaseLocked => ErrorKind::InvalidState,
            Self::Configuration { .. } => ErrorKind::ConfigurationError,
            Self::DatabaseClosed | Self::IndexDisposed => ErrorKind::Disposed,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_keep_their_kind() {
        let err = CoreError::from(StorageError::not_found("users.data"));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = CoreError::from(StorageError::integrity("bad tag"));
        assert_eq!(err.kind(), ErrorKind::IntegrityFailure);

        let err = CoreError::from(StorageError::Cancelled);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn core_errors_map_to_kinds() {
        assert_eq!(
            CoreError::collection_not_found("x").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CoreError::configuration("missing key").kind(),
            ErrorKind::ConfigurationError
        );
        assert_eq!(CoreError::DatabaseClosed.kind(), ErrorKind::Disposed);
        assert_eq!(
            CoreError::WriteConflict {
                location: "a.data".into()
            }
            .kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            CoreError::wal_corruption("bad type").kind(),
            ErrorKind::IntegrityFailure
        );
    }

    #[test]
    fn messages_carry_context() {
        let err = CoreError::backup_not_found("nightly");
        assert_eq!(err.to_string(), "backup not found: nightly");
        assert_eq!(ErrorKind::IntegrityFailure.to_string(), "integrity failure");
    }
}

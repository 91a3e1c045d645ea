//! Storage error handling
//!
//! Typed errors for opening, migrating and writing the record store, with
//! recovery suggestions for the conditions a caller can act on.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create the data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored record body could not be decoded
    #[error("Record '{key}' is corrupted: {details}")]
    CorruptRecord { key: String, details: String },

    /// The store was created for a different model
    #[error("Store belongs to model '{stored}', not '{requested}'")]
    ModelMismatch { stored: String, requested: String },

    /// The store was written by a newer model version
    #[error("Store is at model version {stored}, newer than version {model} of the model")]
    IncompatibleModel { stored: u32, model: u32 },

    /// A version upgrade is needed but automatic migration is off
    #[error(
        "Store needs migration from version {from} to {to} and automatic migration is disabled"
    )]
    MigrationRequired { from: u32, to: u32 },

    /// A rename needs a mapping but mapping inference is off
    #[error(
        "Entity '{entity}' was renamed from '{renamed_from}' and mapping inference is disabled"
    )]
    MappingRequired {
        entity: String,
        renamed_from: String,
    },

    /// SQLite refused the requested journal mode
    #[error("Journal mode '{requested}' was not applied (database reports '{actual}')")]
    JournalMode { requested: String, actual: String },

    /// Owner-only permissions could not be applied to the store file
    #[error("Failed to restrict permissions on '{path}': {source}")]
    ProtectFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full_error(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::CreateDirectory {
                path,
                source: error,
            },
        }
    }

    /// Check if this error is recoverable without changing the model
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DiskFull { .. }
                | StorageError::PermissionDenied { .. }
                | StorageError::MigrationRequired { .. }
                | StorageError::MappingRequired { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions for the data directory.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StorageError::MigrationRequired { .. } => {
                Some("Enable `store.auto_migrate` in the configuration.")
            }
            StorageError::MappingRequired { .. } => {
                Some("Enable `store.infer_mapping` in the configuration.")
            }
            StorageError::ProtectFile { .. } => {
                Some("Check that the store file is owned by the current user.")
            }
            StorageError::IncompatibleModel { .. } => {
                Some("Open the store with the newer model version that created it.")
            }
            _ => None,
        }
    }

    /// Whether the database reported a lock held by another connection
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            StorageError::Database(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = StorageError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(matches!(err, StorageError::DiskFull { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_other_io_is_directory_failure() {
        let io_err = io::Error::new(io::ErrorKind::Other, "read-only file system");
        let err = StorageError::from_io(io_err, PathBuf::from("/ro"));

        assert!(matches!(err, StorageError::CreateDirectory { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_incompatible_model_is_not_recoverable() {
        let err = StorageError::IncompatibleModel { stored: 3, model: 2 };

        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("version 3"));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_busy_detection() {
        let err = StorageError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ));
        assert!(err.is_busy());

        let err = StorageError::CorruptRecord {
            key: "Book/1".to_string(),
            details: "expected value".to_string(),
        };
        assert!(!err.is_busy());
    }
}

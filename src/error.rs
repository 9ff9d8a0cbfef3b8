//! Error types for VexDB.
//!
//! VexDB uses a hierarchical error system:
//! - `VexDBError` is the top-level error returned by all public APIs
//! - Specific error types (`StorageError`, `ValidationError`) provide detail
//!
//! # Error Handling Pattern
//! ```rust,ignore
//! use vexdb::{Config, Result, VexDB};
//!
//! fn example() -> Result<()> {
//!     let db = VexDB::open(Config::default())?;
//!     // ... operations that may fail ...
//!     db.close()?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias for VexDB operations.
pub type Result<T> = std::result::Result<T, VexDBError>;

/// Top-level error enum for all VexDB operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Error)]
pub enum VexDBError {
    /// Operation attempted before `initialize()` completed.
    #[error("Database not initialized")]
    NotInitialized,

    /// Storage layer error (WAL, snapshots, recovery, corruption).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Input validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Requested entity not found.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// Insert attempted with a key that already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Vector index error (KD-tree, LSH, or HNSW operations).
    #[error("Vector index error: {0}")]
    Index(String),

    /// An internal lock was poisoned by a panicking thread.
    #[error("Lock poisoned: {0}")]
    Poisoned(String),
}

impl VexDBError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a vector index error with the given message.
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Creates a lock-poisoned error naming the poisoned resource.
    pub fn poisoned(resource: impl Into<String>) -> Self {
        Self::Poisoned(resource.into())
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is a duplicate key error.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }

    /// Returns true if this is an I/O error (including wrapped WAL I/O).
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Storage-related errors.
///
/// These errors indicate problems with the write-ahead log, snapshot
/// files, or the recovery workflow.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Snapshot or WAL data is corrupted.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// A record or file checksum did not match its contents.
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum recorded on disk.
        expected: u32,
        /// Checksum recomputed from the data.
        actual: u32,
    },

    /// Snapshot file version is not supported by this build.
    #[error("Unsupported snapshot version: expected {expected}, found {found}")]
    UnsupportedVersion {
        /// Version this build reads and writes.
        expected: u32,
        /// Version found in the file header.
        found: u32,
    },

    /// A recovery state machine transition that the protocol forbids.
    ///
    /// This is a programmer error: recovery drivers must follow the
    /// documented transition table.
    #[error("Invalid recovery transition: {from} -> {to}")]
    InvalidTransition {
        /// State the machine was in.
        from: &'static str,
        /// State the caller tried to enter.
        to: &'static str,
    },

    /// On-disk state needs recovery but `auto_recovery` is disabled.
    #[error("Recovery required: {0}")]
    RecoveryRequired(String),

    /// Recovery ran and could not bring the database to a usable state.
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),
}

impl StorageError {
    /// Creates a corruption error with the given message.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Creates a recovery-failed error with the given message.
    pub fn recovery_failed(msg: impl Into<String>) -> Self {
        Self::RecoveryFailed(msg.into())
    }
}

/// Validation errors for input data.
///
/// These errors indicate problems with data provided by the caller.
/// They are rejected before any side effect takes place.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Vector length doesn't match the database's configured dimension.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension the database was opened with.
        expected: usize,
        /// Length of the vector provided.
        got: usize,
    },

    /// A vector component is NaN or infinite.
    #[error("Non-finite value at component {position}")]
    NonFinite {
        /// Index of the first offending component.
        position: usize,
    },

    /// A field has an invalid value.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Name of the invalid field.
        field: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// A required field is missing or empty.
    #[error("Required field missing: {field}")]
    RequiredField {
        /// Name of the missing field.
        field: String,
    },

    /// A batch exceeds the configured maximum size, or is empty.
    #[error("Invalid batch: {reason}")]
    InvalidBatch {
        /// Why the batch was rejected.
        reason: String,
    },
}

impl ValidationError {
    /// Creates a dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        Self::DimensionMismatch { expected, got }
    }

    /// Creates a non-finite value error.
    pub fn non_finite(position: usize) -> Self {
        Self::NonFinite { position }
    }

    /// Creates an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a required field error.
    pub fn required_field(field: impl Into<String>) -> Self {
        Self::RequiredField {
            field: field.into(),
        }
    }

    /// Creates an invalid batch error.
    pub fn invalid_batch(reason: impl Into<String>) -> Self {
        Self::InvalidBatch {
            reason: reason.into(),
        }
    }
}

/// Not found errors for specific entity types.
#[derive(Debug, Error)]
pub enum NotFoundError {
    /// No entry exists under the given key.
    #[error("Key not found: {0}")]
    Key(String),
}

impl NotFoundError {
    /// Creates a key not found error.
    pub fn key(key: impl ToString) -> Self {
        Self::Key(key.to_string())
    }
}

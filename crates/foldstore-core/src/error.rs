//! Error types for FoldStore operations
//!
//! Storage failures (I/O, WAL corruption) and resolution failures (a merge
//! operator rejecting an operand) share one enum so every public call can
//! return `FoldResult<T>`. Resolution failures are isolated per key.

use std::path::PathBuf;

use thiserror::Error;

/// FoldStore error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum FoldError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// WAL record is structurally invalid
    #[error("WAL corrupted in {} at offset {offset}: {reason}", path.display())]
    WalCorrupted {
        /// Path to the corrupted WAL file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error("Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", path.display())]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted data
        offset: u64,
    },

    /// Partial write at the end of a WAL file
    #[error("Torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", path.display())]
    TornWrite {
        /// File with torn write
        path: PathBuf,
        /// Expected record size
        expected_size: u32,
        /// Actual bytes available
        available_bytes: u64,
        /// Offset where torn write begins
        offset: u64,
    },

    /// Magic bytes not found at expected location
    #[error("Magic bytes not found in {} at offset {offset}: found {:02x}{:02x}{:02x}{:02x}", path.display(), found_bytes[0], found_bytes[1], found_bytes[2], found_bytes[3])]
    NoMagicFound {
        /// File being read
        path: PathBuf,
        /// Offset where magic was expected
        offset: u64,
        /// Bytes actually found
        found_bytes: [u8; 4],
    },

    /// Key or value exceeds the configured size limit
    #[error("Entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized component
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// "key" or "value"
        component: String,
    },

    /// The merge operator rejected an operand (or the value it was folded onto).
    ///
    /// The fold for that key is abandoned: reads surface this error and
    /// compaction leaves the key's operands in place.
    #[error("Merge operator '{operator}' failed on key {key:02x?} at operand {operand_index}: {reason}")]
    CombinatorFailure {
        /// Name reported by the operator
        operator: String,
        /// Key under resolution
        key: Vec<u8>,
        /// Zero-based index of the rejected operand in the pending chain
        operand_index: usize,
        /// Reason given by the operator
        reason: String,
    },

    /// A merge was written or resolved without a merge operator configured
    #[error("No merge operator configured (key {key:02x?})")]
    MissingMergeOperator {
        /// Key whose merge could not be handled
        key: Vec<u8>,
    },

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FoldError {
    /// Wrap an `io::Error` with the path it happened on.
    pub(crate) fn io_at(path: impl Into<PathBuf>, err: &std::io::Error, context: &str) -> Self {
        FoldError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }

    /// True for errors raised by user-supplied merge logic rather than storage.
    pub fn is_resolution_error(&self) -> bool {
        matches!(self, FoldError::CombinatorFailure { .. } | FoldError::MissingMergeOperator { .. })
    }
}

/// Convert std::io::Error to FoldError::Io
impl From<std::io::Error> for FoldError {
    fn from(err: std::io::Error) -> Self {
        FoldError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for FoldStore operations
pub type FoldResult<T> = Result<T, FoldError>;

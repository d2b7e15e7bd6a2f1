//! Error types for the KeelDB storage core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in KeelDB core operations.
///
/// The taxonomy follows a simple rule: corruption confined to an index file
/// is recoverable (index files are derived state and rebuildable from the
/// logs), while corruption in a log or value file, unresolvable recovery
/// boundaries under safe recovery, and resource exhaustion past the LRU
/// strategy are fatal and operator-actionable.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] keeldb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A paged block failed its bracketing self-check or is otherwise
    /// malformed. Triggers the fallback linear scan, not an abort.
    #[error("paging corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// No valid closure could be found anywhere in a log or value file.
    ///
    /// Index files are always rebuildable from log files; log files are
    /// not, so this blocks the table from opening.
    #[error(
        "fatal storage error: {message}; restore from backup, or remove the \
         table's index (.irt) files to force a rebuild from the logs"
    )]
    FatalStorage {
        /// Description of the unrecoverable condition.
        message: String,
    },

    /// A file is stamped with a protocol generation this engine can no
    /// longer decode.
    #[error("unsupported protocol {code}: reads support only the two most recent generations")]
    UnsupportedProtocol {
        /// The on-disk protocol code.
        code: i64,
    },

    /// Replay could not establish a consistent key/value boundary and safe
    /// recovery is enabled; the engine refuses to guess.
    #[error("recovery ambiguous: {message}; disable safe recovery to fall back to the file header")]
    RecoveryAmbiguous {
        /// Description of the unresolved boundary.
        message: String,
    },

    /// Another process holds the table's advisory lock.
    #[error("table locked: another process has exclusive access")]
    TableLocked,

    /// The open-file budget is exhausted and every handle is active.
    #[error("file descriptor budget exhausted: all {budget} handles are active")]
    FileLimitExhausted {
        /// The configured open-file budget.
        budget: usize,
    },

    /// Invalid file format or version header.
    #[error("invalid file format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Checksum mismatch on a value payload.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },
}

impl CoreError {
    /// Creates a paging corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a fatal storage error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::FatalStorage {
            message: message.into(),
        }
    }

    /// Creates a recovery-ambiguity error.
    pub fn recovery_ambiguous(message: impl Into<String>) -> Self {
        Self::RecoveryAmbiguous {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// True when the error is fatal and operator-actionable rather than
    /// locally recoverable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalStorage { .. }
                | Self::RecoveryAmbiguous { .. }
                | Self::FileLimitExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_is_not_fatal() {
        assert!(!CoreError::corruption("torn block").is_fatal());
    }

    #[test]
    fn fatal_variants() {
        assert!(CoreError::fatal("no closure").is_fatal());
        assert!(CoreError::recovery_ambiguous("boundary").is_fatal());
        assert!(CoreError::FileLimitExhausted { budget: 4 }.is_fatal());
    }

    #[test]
    fn fatal_message_carries_remediation() {
        let err = CoreError::fatal("no valid closure in 000001.lrt");
        let text = err.to_string();
        assert!(text.contains("restore from backup"));
    }
}

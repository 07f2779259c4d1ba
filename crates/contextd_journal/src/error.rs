//! Error types for the journal crate.

use std::io;
use thiserror::Error;

/// Result type for journal and sequence operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur in the journal and sequence stores.
#[derive(Debug, Error)]
pub enum JournalError {
    /// The caller's baseline is stale against the journal tail.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// The request is malformed or incomplete for its type.
    #[error("invalid request: {0}")]
    Request(String),

    /// The backing store rejected the operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// An entry already exists at this csn.
    #[error("duplicate csn {csn}")]
    DuplicateCsn {
        /// The conflicting csn.
        csn: u64,
    },

    /// Persisted data failed validation.
    #[error("journal corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the context directory.
    #[error("context directory locked: another process has exclusive access")]
    Locked,

    /// Canonical encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] contextd_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl JournalError {
    /// Create a consistency error.
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency(message.into())
    }

    /// Create a request error.
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Returns true if the backing store failed, as opposed to the request.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            JournalError::Storage(_)
                | JournalError::DuplicateCsn { .. }
                | JournalError::Corrupted(_)
                | JournalError::Locked
                | JournalError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_classification() {
        assert!(JournalError::corrupted("bad crc").is_storage());
        assert!(JournalError::DuplicateCsn { csn: 3 }.is_storage());
        assert!(!JournalError::consistency("stale").is_storage());
        assert!(!JournalError::request("missing new").is_storage());
    }

    #[test]
    fn error_display() {
        let err = JournalError::DuplicateCsn { csn: 42 };
        assert_eq!(err.to_string(), "duplicate csn 42");
    }
}

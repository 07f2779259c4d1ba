//! Error types for the context manager.

use contextd_codec::CodecError;
use contextd_journal::JournalError;
use std::time::Duration;
use thiserror::Error;

/// Result type for context manager operations.
pub type ContextResult<T> = Result<T, ContextError>;

/// Errors that can occur in the context manager.
#[derive(Error, Debug)]
pub enum ContextError {
    /// The caller's read is stale.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// The request is malformed or incomplete for its type.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// This process does not hold the leadership lease.
    #[error("not leader")]
    NotLeader,

    /// No context is registered under this database name.
    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    /// The journal or sequence store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A store call did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The store call that stalled.
        operation: &'static str,
        /// The configured bound.
        after: Duration,
    },

    /// The election or broadcast primitive failed.
    #[error("coordinator error: {0}")]
    Coordinator(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ContextError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ContextError::Consistency(_)
                | ContextError::InvalidRequest(_)
                | ContextError::NotLeader
                | ContextError::UnknownDatabase(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            ContextError::Storage(_)
                | ContextError::Timeout { .. }
                | ContextError::Coordinator(_)
                | ContextError::Config(_)
                | ContextError::Codec(_)
        )
    }
}

impl From<JournalError> for ContextError {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::Consistency(msg) => ContextError::Consistency(msg),
            JournalError::Request(msg) => ContextError::InvalidRequest(msg),
            JournalError::Codec(e) => ContextError::Codec(e),
            other => ContextError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ContextError::NotLeader.is_client_error());
        assert!(ContextError::Consistency("stale".into()).is_client_error());
        assert!(ContextError::Storage("disk".into()).is_server_error());
        assert!(!ContextError::InvalidRequest("bad".into()).is_server_error());
    }

    #[test]
    fn journal_errors_keep_their_kind() {
        assert!(matches!(
            ContextError::from(JournalError::consistency("x")),
            ContextError::Consistency(_)
        ));
        assert!(matches!(
            ContextError::from(JournalError::request("x")),
            ContextError::InvalidRequest(_)
        ));
        assert!(matches!(
            ContextError::from(JournalError::DuplicateCsn { csn: 4 }),
            ContextError::Storage(_)
        ));
    }

    #[test]
    fn timeout_display() {
        let err = ContextError::Timeout {
            operation: "journal.insert",
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "journal.insert timed out after 250ms");
    }
}

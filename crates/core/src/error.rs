//! Error taxonomy surfaced to feed clients.
//!
//! Feed results carry an `(ErrorType, message)` pair. The error types are
//! frozen: they are the wire-visible classification every client branches
//! on, so adding or renaming a variant is a breaking change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a feed result.
///
/// - `None`: success (also used for silently dropped outdated operations)
/// - `TransientError`: retryable after client-side correction (e.g. an
///   update referencing a field the active type no longer has)
/// - `ResourceExhausted`: write rejected by the resource filter
/// - `PermanentError`: malformed input, will never succeed
/// - `TimestampConflict`: lost a newest-wins race
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ErrorType {
    /// Success.
    #[default]
    None,
    /// Retryable failure.
    TransientError,
    /// Rejected by the resource write filter.
    ResourceExhausted,
    /// Unrecoverable failure.
    PermanentError,
    /// Lost a newest-wins conflict.
    TimestampConflict,
}

impl ErrorType {
    /// Stable string form used in logs and status reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::None => "NONE",
            ErrorType::TransientError => "TRANSIENT_ERROR",
            ErrorType::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorType::PermanentError => "PERMANENT_ERROR",
            ErrorType::TimestampConflict => "TIMESTAMP_CONFLICT",
        }
    }

    /// True for any non-success classification.
    pub fn is_error(&self) -> bool {
        !matches!(self, ErrorType::None)
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the core types themselves.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A document id string did not parse.
    #[error("invalid document id: '{input}'")]
    InvalidDocumentId {
        /// The offending input.
        input: String,
    },

    /// A component was asked to do something its current state forbids.
    #[error("{0}")]
    IllegalState(String),

    /// An unknown document type was referenced.
    #[error("unknown document type '{name}'")]
    UnknownDocumentType {
        /// The referenced type name.
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_strings() {
        assert_eq!(ErrorType::None.as_str(), "NONE");
        assert_eq!(ErrorType::ResourceExhausted.as_str(), "RESOURCE_EXHAUSTED");
        assert_eq!(ErrorType::TransientError.as_str(), "TRANSIENT_ERROR");
    }

    #[test]
    fn test_error_type_classification() {
        assert!(!ErrorType::None.is_error());
        assert!(ErrorType::TimestampConflict.is_error());
        assert!(ErrorType::PermanentError.is_error());
    }

    #[test]
    fn test_illegal_state_message_is_verbatim() {
        let err = CoreError::IllegalState("Failed to prune TLS to token 10.".to_string());
        assert_eq!(err.to_string(), "Failed to prune TLS to token 10.");
    }
}

//! Error types for docsync core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in docsync core operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Document ID is empty or otherwise unusable.
    #[error("invalid document ID {doc_id:?}: {reason}")]
    InvalidDocumentId {
        /// The rejected ID.
        doc_id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Document does not exist (or is deleted).
    #[error("document not found: {doc_id}")]
    DocumentNotFound {
        /// The document that was not found.
        doc_id: String,
    },

    /// The write was based on a revision that is no longer current, or would
    /// create a branch where branches are not allowed.
    #[error("revision conflict on document {doc_id}")]
    Conflict {
        /// The conflicting document.
        doc_id: String,
    },

    /// Malformed revision ID or revision history.
    #[error("invalid revision: {0}")]
    InvalidRevision(String),

    /// Property tree could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Transaction was aborted and rolled back.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// Another replicator holds the checkpoint for this pairing.
    #[error("checkpoint {checkpoint_id} is held by another replicator")]
    CheckpointBusy {
        /// The contested checkpoint.
        checkpoint_id: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    /// Creates an invalid document ID error.
    pub fn invalid_document_id(doc_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDocumentId {
            doc_id: doc_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a document not found error.
    pub fn not_found(doc_id: impl Into<String>) -> Self {
        Self::DocumentNotFound {
            doc_id: doc_id.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(doc_id: impl Into<String>) -> Self {
        Self::Conflict {
            doc_id: doc_id.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl std::fmt::Display) -> Self {
        Self::Codec(message.to_string())
    }

    /// Creates a transaction aborted error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Returns true if this error is a revision conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::conflict("foo");
        assert_eq!(err.to_string(), "revision conflict on document foo");
        assert!(err.is_conflict());

        let err = CoreError::invalid_document_id("", "must not be empty");
        assert!(err.to_string().contains("must not be empty"));
        assert!(!err.is_conflict());
    }

    #[test]
    fn checkpoint_busy_names_the_checkpoint() {
        let err = CoreError::CheckpointBusy {
            checkpoint_id: "cp-1".into(),
        };
        assert!(err.to_string().contains("cp-1"));
    }
}

//! Error types for the replicator.

use docsync_core::CoreError;
use docsync_protocol::{ErrorCode, ProtocolError, WireError};
use thiserror::Error;

/// Result type for replicator operations.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Errors that can occur while configuring or running a replicator.
///
/// Errors are cloneable so the last one can be kept in
/// [`ReplicatorStatus`](crate::ReplicatorStatus) and handed to listeners.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicatorError {
    /// Configuration rejected at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed endpoint URL.
    #[error("invalid endpoint {url:?}: {reason}")]
    InvalidEndpoint {
        /// The URL as given.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The peer's certificate does not match the pinned one.
    #[error("certificate pinning failed: {0}")]
    CertificateMismatch(String),

    /// The peer rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The peer refused access.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The peer reported an error.
    #[error("peer error {} ({code:?}): {message}", code.status())]
    Peer {
        /// Error category.
        code: ErrorCode,
        /// Peer-provided detail.
        message: String,
    },

    /// Malformed or unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local database error.
    #[error("database error: {0}")]
    Database(#[from] CoreError),

    /// Another replicator is running on the same pairing.
    #[error("checkpoint {checkpoint_id} is in use by another replicator")]
    CheckpointBusy {
        /// The contested checkpoint.
        checkpoint_id: String,
    },

    /// The document conflicts with the peer's copy.
    #[error("document {doc_id} conflicts with the remote revision")]
    Conflict {
        /// The document.
        doc_id: String,
    },

    /// The revision does not fit in one frame and was not transferred.
    #[error("document {doc_id} is too large to replicate")]
    DocumentTooLarge {
        /// The document.
        doc_id: String,
    },

    /// The pull filter rejected the incoming revision.
    #[error("document {doc_id} was rejected by the pull filter")]
    FilterRejected {
        /// The document.
        doc_id: String,
    },

    /// Operation not valid in the current activity level.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ReplicatorError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicatorError::Transport { retryable, .. } => *retryable,
            ReplicatorError::Peer { code, .. } => code.is_transient(),
            _ => false,
        }
    }

    /// Maps a request-level error reported by the peer.
    pub fn from_wire(error: WireError) -> Self {
        match error.code {
            ErrorCode::Unauthorized => ReplicatorError::AuthenticationFailed(error.message),
            ErrorCode::Forbidden => ReplicatorError::Forbidden(error.message),
            code => ReplicatorError::Peer {
                code,
                message: error.message,
            },
        }
    }

    /// Maps a per-document error reported by the peer.
    pub fn from_document_error(doc_id: &str, error: WireError) -> Self {
        match error.code {
            ErrorCode::Conflict => ReplicatorError::Conflict {
                doc_id: doc_id.to_string(),
            },
            ErrorCode::TooLarge => ReplicatorError::DocumentTooLarge {
                doc_id: doc_id.to_string(),
            },
            _ => Self::from_wire(error),
        }
    }
}

impl From<ProtocolError> for ReplicatorError {
    fn from(err: ProtocolError) -> Self {
        if err.is_connection_error() {
            ReplicatorError::transport_retryable(err.to_string())
        } else {
            ReplicatorError::Protocol(err.to_string())
        }
    }
}

/// True for storage errors that concern a single document and must not stop
/// the replication.
pub(crate) fn is_document_error(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::Conflict { .. }
            | CoreError::InvalidRevision(_)
            | CoreError::InvalidDocumentId { .. }
            | CoreError::DocumentNotFound { .. }
            | CoreError::Codec(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ReplicatorError::transport_retryable("connection lost").is_retryable());
        assert!(!ReplicatorError::transport_fatal("wss unsupported").is_retryable());
        assert!(ReplicatorError::from_wire(WireError::new(ErrorCode::Unavailable, "")).is_retryable());
        assert!(!ReplicatorError::AuthenticationFailed("no".into()).is_retryable());
        assert!(!ReplicatorError::CertificateMismatch("x".into()).is_retryable());
    }

    #[test]
    fn wire_mapping() {
        assert!(matches!(
            ReplicatorError::from_wire(WireError::new(ErrorCode::Unauthorized, "who")),
            ReplicatorError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            ReplicatorError::from_wire(WireError::new(ErrorCode::Forbidden, "no")),
            ReplicatorError::Forbidden(_)
        ));
        assert_eq!(
            ReplicatorError::from_document_error("doc", WireError::new(ErrorCode::Conflict, "")),
            ReplicatorError::Conflict {
                doc_id: "doc".into()
            }
        );
        assert_eq!(
            ReplicatorError::from_document_error("big", WireError::new(ErrorCode::TooLarge, "")),
            ReplicatorError::DocumentTooLarge {
                doc_id: "big".into()
            }
        );
    }

    #[test]
    fn protocol_errors() {
        let closed: ReplicatorError = ProtocolError::ConnectionClosed.into();
        assert!(closed.is_retryable());
        let bad: ReplicatorError = ProtocolError::Decode("junk".into()).into();
        assert!(!bad.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = ReplicatorError::Peer {
            code: ErrorCode::Internal,
            message: "oops".into(),
        };
        assert!(err.to_string().contains("500"));
        assert!(is_document_error(&CoreError::conflict("d")));
        assert!(!is_document_error(&CoreError::aborted("x")));
    }
}

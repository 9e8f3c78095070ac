//! Error types for the replication peer.

use docsync_core::CoreError;
use docsync_protocol::{ErrorCode, ProtocolError, WireError};
use thiserror::Error;

/// Result type for peer operations.
pub type PeerResult<T> = Result<T, PeerError>;

/// Errors that can occur in the replication peer.
#[derive(Error, Debug)]
pub enum PeerError {
    /// Invalid request content.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or wrong credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Credentials are valid but access is denied.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local database error.
    #[error("database error: {0}")]
    Database(#[from] CoreError),

    /// Framing or encoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// TLS session error.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PeerError::InvalidRequest(_)
                | PeerError::AuthenticationFailed(_)
                | PeerError::Forbidden(_)
        ) || matches!(self, PeerError::Database(err) if err.is_conflict())
    }

    /// Converts to the error sent back to the replicator.
    pub fn to_wire(&self) -> WireError {
        let code = match self {
            PeerError::InvalidRequest(_) => ErrorCode::BadRequest,
            PeerError::AuthenticationFailed(_) => ErrorCode::Unauthorized,
            PeerError::Forbidden(_) => ErrorCode::Forbidden,
            PeerError::Database(CoreError::Conflict { .. }) => ErrorCode::Conflict,
            PeerError::Database(CoreError::DocumentNotFound { .. }) => ErrorCode::NotFound,
            PeerError::Database(
                CoreError::InvalidDocumentId { .. } | CoreError::InvalidRevision(_),
            ) => ErrorCode::BadRequest,
            PeerError::InvalidConfig(_)
            | PeerError::Database(_)
            | PeerError::Protocol(_)
            | PeerError::Tls(_)
            | PeerError::Io(_) => ErrorCode::Internal,
        };
        WireError::new(code, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(PeerError::InvalidRequest("bad".into()).is_client_error());
        assert!(PeerError::Database(CoreError::conflict("doc")).is_client_error());
        assert!(!PeerError::InvalidConfig("x".into()).is_client_error());
    }

    #[test]
    fn wire_codes() {
        assert_eq!(
            PeerError::Database(CoreError::conflict("doc")).to_wire().code,
            ErrorCode::Conflict
        );
        assert_eq!(
            PeerError::AuthenticationFailed("no".into()).to_wire().code,
            ErrorCode::Unauthorized
        );
        assert_eq!(
            PeerError::Database(CoreError::codec("boom")).to_wire().code,
            ErrorCode::Internal
        );
    }
}

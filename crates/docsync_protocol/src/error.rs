//! Error types for the replication protocol.

use std::io;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding, decoding or moving frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A frame payload is not a valid message.
    #[error("decode error: {0}")]
    Decode(String),

    /// A frame exceeds the size limit.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced or actual frame length.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// The peer answered with a message of the wrong kind.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// What was expected.
        expected: &'static str,
        /// What arrived.
        actual: &'static str,
    },

    /// The stream ended.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The WebSocket layer failed.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Underlying I/O failure.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        /// The I/O error kind.
        kind: io::ErrorKind,
        /// Error text.
        message: String,
    },
}

impl ProtocolError {
    /// Returns true for failures of the connection itself rather than of
    /// message content.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionClosed | ProtocolError::Io { .. } | ProtocolError::WebSocket(_)
        )
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<tungstenite::Error> for ProtocolError {
    fn from(err: tungstenite::Error) -> Self {
        use tungstenite::error::{CapacityError, ProtocolError as WsProtocolError};
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                ProtocolError::ConnectionClosed
            }
            tungstenite::Error::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                ProtocolError::ConnectionClosed
            }
            tungstenite::Error::Io(err) => err.into(),
            tungstenite::Error::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                ProtocolError::FrameTooLarge {
                    len: size,
                    max: max_size,
                }
            }
            other => ProtocolError::WebSocket(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_kind() {
        let err: ProtocolError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(
            err,
            ProtocolError::Io {
                kind: io::ErrorKind::TimedOut,
                ..
            }
        ));
        assert!(err.is_connection_error());
        assert!(!ProtocolError::Decode("x".into()).is_connection_error());
    }

    #[test]
    fn websocket_errors_map_onto_protocol_errors() {
        assert_eq!(
            ProtocolError::from(tungstenite::Error::ConnectionClosed),
            ProtocolError::ConnectionClosed
        );
        let too_long = tungstenite::Error::Capacity(
            tungstenite::error::CapacityError::MessageTooLong {
                size: 10,
                max_size: 4,
            },
        );
        assert_eq!(
            ProtocolError::from(too_long),
            ProtocolError::FrameTooLarge { len: 10, max: 4 }
        );
    }
}

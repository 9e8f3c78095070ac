//! Protocol messages for replication.
//!
//! Every exchange is a request from the active side (the replicator) followed
//! by exactly one reply from the passive side (the peer). Messages are CBOR
//! encoded through serde; [`crate::FrameCodec`] adds the length prefix.

use crate::error::{ProtocolError, ProtocolResult};
use docsync_core::{RevisionId, RevisionInsert};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Cookie name used for session authentication unless configured otherwise.
pub const DEFAULT_COOKIE_NAME: &str = "SyncGatewaySession";

/// A replication protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Handshake request.
    Hello(Hello),
    /// Handshake response.
    HelloReply(HelloReply),
    /// Asks for the peer's copy of a checkpoint.
    GetCheckpoint {
        /// Pairing identity.
        checkpoint_id: String,
    },
    /// The peer's copy of a checkpoint, if it has one.
    CheckpointReply {
        /// Encoded checkpoint.
        checkpoint: Option<Vec<u8>>,
    },
    /// Stores a checkpoint on the peer. Answered with [`Message::Ack`].
    SetCheckpoint {
        /// Pairing identity.
        checkpoint_id: String,
        /// Encoded checkpoint.
        checkpoint: Vec<u8>,
    },
    /// Asks for the peer's changes after a sequence.
    SubChanges(SubChanges),
    /// One window of the peer's changes feed.
    Changes(ChangesBatch),
    /// Offers revisions to the peer.
    RevsDiff {
        /// Revisions the sender has.
        proposed: Vec<ProposedRevision>,
    },
    /// The offered revisions the peer lacks.
    RevsDiffReply {
        /// Missing revisions with what the peer already has.
        missing: Vec<MissingRevision>,
    },
    /// Asks for revision bodies and histories.
    GetRevs {
        /// Requested revisions.
        requests: Vec<RevisionRequest>,
    },
    /// Revision bodies and histories.
    Revs {
        /// The revisions, in request order.
        revisions: Vec<RevisionPayload>,
        /// Requested revisions the peer will not send, with the reason.
        #[serde(default)]
        refused: Vec<DocumentResult>,
        /// True if the reply stopped early to stay under the frame limit;
        /// the unanswered requests can be asked for again.
        #[serde(default)]
        truncated: bool,
    },
    /// Sends revisions for the peer to store.
    PushRevs {
        /// The revisions.
        revisions: Vec<RevisionPayload>,
    },
    /// Per-document outcome of a push.
    PushReply {
        /// One result per pushed revision.
        results: Vec<DocumentResult>,
    },
    /// Ends the session. Answered with [`Message::Ack`].
    Close,
    /// Generic acknowledgement.
    Ack,
    /// Request-level failure.
    Error(WireError),
}

impl Message {
    /// Returns a short name for the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::HelloReply(_) => "HelloReply",
            Message::GetCheckpoint { .. } => "GetCheckpoint",
            Message::CheckpointReply { .. } => "CheckpointReply",
            Message::SetCheckpoint { .. } => "SetCheckpoint",
            Message::SubChanges(_) => "SubChanges",
            Message::Changes(_) => "Changes",
            Message::RevsDiff { .. } => "RevsDiff",
            Message::RevsDiffReply { .. } => "RevsDiffReply",
            Message::GetRevs { .. } => "GetRevs",
            Message::Revs { .. } => "Revs",
            Message::PushRevs { .. } => "PushRevs",
            Message::PushReply { .. } => "PushReply",
            Message::Close => "Close",
            Message::Ack => "Ack",
            Message::Error(_) => "Error",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(out)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Handshake request from the replicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version spoken by the client.
    pub protocol_version: u16,
    /// Identity of the client database.
    pub client_id: String,
    /// Name of the remote database the client wants.
    pub database: String,
    /// HTTP-style headers, including `Authorization` and `Cookie`.
    pub headers: BTreeMap<String, String>,
    /// Largest frame payload the client accepts (0 for the peer's default).
    #[serde(default)]
    pub max_frame_len: u64,
}

impl Hello {
    /// Creates a handshake request for the current protocol version.
    pub fn new(client_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            client_id: client_id.into(),
            database: database.into(),
            headers: BTreeMap::new(),
            max_frame_len: 0,
        }
    }

    /// Looks a header up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Handshake response from the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Whether the session was accepted.
    pub accepted: bool,
    /// Identity of the peer database.
    pub peer_id: String,
    /// Protocol version spoken by the peer.
    pub protocol_version: u16,
    /// Session cookie issued after a successful basic login.
    pub session: Option<String>,
    /// Why the session was refused.
    pub error: Option<WireError>,
}

impl HelloReply {
    /// Creates an accepting reply.
    pub fn accepted(peer_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            peer_id: peer_id.into(),
            protocol_version: PROTOCOL_VERSION,
            session: None,
            error: None,
        }
    }

    /// Creates a refusing reply.
    pub fn refused(error: WireError) -> Self {
        Self {
            accepted: false,
            peer_id: String::new(),
            protocol_version: PROTOCOL_VERSION,
            session: None,
            error: Some(error),
        }
    }
}

/// Error category carried on the wire, numbered like HTTP statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed request.
    BadRequest,
    /// Missing or wrong credentials.
    Unauthorized,
    /// Credentials valid but access denied.
    Forbidden,
    /// Unknown database or document.
    NotFound,
    /// Revision conflicts with the peer's copy.
    Conflict,
    /// A document does not fit in one frame.
    TooLarge,
    /// Incompatible protocol version.
    VersionMismatch,
    /// Peer-side failure.
    Internal,
    /// Peer temporarily unable to serve.
    Unavailable,
}

impl ErrorCode {
    /// HTTP-equivalent status code.
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::TooLarge => 413,
            ErrorCode::VersionMismatch => 426,
            ErrorCode::Internal => 500,
            ErrorCode::Unavailable => 503,
        }
    }

    /// True if repeating the request later may succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorCode::Internal | ErrorCode::Unavailable)
    }
}

/// A failure reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Category.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl WireError {
    /// Creates a wire error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Changes feed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubChanges {
    /// Only changes with a higher sequence are returned.
    pub since: u64,
    /// Maximum number of changes in the reply.
    pub limit: u32,
    /// Restricts the feed to documents in these channels (empty for all).
    pub channels: Vec<String>,
    /// Restricts the feed to these documents (empty for all).
    pub doc_ids: Vec<String>,
}

/// One window of a changes feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesBatch {
    /// Changes in sequence order.
    pub changes: Vec<Change>,
    /// Highest sequence scanned, including changes filtered out.
    pub last_sequence: u64,
    /// True if nothing remains after this window.
    pub caught_up: bool,
}

/// A document's latest change as seen in a changes feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Sequence of the change on the sender.
    pub sequence: u64,
    /// The document.
    pub doc_id: String,
    /// Its current revision.
    pub revision_id: RevisionId,
    /// Whether the revision is a deletion.
    pub deleted: bool,
    /// The document left every channel the reader may see.
    pub access_removed: bool,
}

/// A revision offered in a revs-diff request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedRevision {
    /// The document.
    pub doc_id: String,
    /// The offered revision.
    pub revision_id: RevisionId,
}

/// A revision the receiver lacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingRevision {
    /// The document.
    pub doc_id: String,
    /// The missing revision.
    pub revision_id: RevisionId,
    /// Revisions the receiver has that may be ancestors of it.
    pub possible_ancestors: Vec<RevisionId>,
}

/// Request for one revision body and its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRequest {
    /// The document.
    pub doc_id: String,
    /// The wanted revision.
    pub revision_id: RevisionId,
    /// Ancestors the requester already has; history may stop at these.
    pub known_ancestors: Vec<RevisionId>,
}

/// A revision with the history the receiver needs to place it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionPayload {
    /// The document.
    pub doc_id: String,
    /// History, newest first; `history[0]` is the revision itself.
    pub history: Vec<RevisionId>,
    /// Whether the revision is a deletion.
    pub deleted: bool,
    /// Encoded property tree.
    pub body: Vec<u8>,
}

impl RevisionPayload {
    /// The revision carried.
    pub fn revision_id(&self) -> Option<&RevisionId> {
        self.history.first()
    }

    /// Converts to a store insert.
    pub fn to_insert(&self) -> RevisionInsert {
        RevisionInsert {
            doc_id: self.doc_id.clone(),
            history: self.history.clone(),
            deleted: self.deleted,
            body: self.body.clone(),
        }
    }
}

/// Outcome for one pushed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentResult {
    /// The document.
    pub doc_id: String,
    /// The pushed revision.
    pub revision_id: RevisionId,
    /// Why the revision was refused.
    pub error: Option<WireError>,
}

impl DocumentResult {
    /// A stored revision.
    pub fn ok(doc_id: impl Into<String>, revision_id: RevisionId) -> Self {
        Self {
            doc_id: doc_id.into(),
            revision_id,
            error: None,
        }
    }

    /// A refused revision.
    pub fn failed(doc_id: impl Into<String>, revision_id: RevisionId, error: WireError) -> Self {
        Self {
            doc_id: doc_id.into(),
            revision_id,
            error: Some(error),
        }
    }
}

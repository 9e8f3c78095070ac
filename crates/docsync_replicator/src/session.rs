//! Transfer session: one authenticated connection to a peer.

use crate::config::ReplicatorConfiguration;
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::transport::{ConnectOptions, Connection, Connector};
use docsync_core::Checkpoint;
use docsync_protocol::{
    ChangesBatch, DocumentResult, Hello, Message, MissingRevision, ProposedRevision,
    RevisionPayload, RevisionRequest, SubChanges,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// SHA-256 fingerprint of a DER certificate.
pub fn certificate_fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

/// Checks the certificate a peer presented against the pinned one.
///
/// Fails closed: a pinned certificate with nothing presented is a mismatch.
pub fn verify_pinned_certificate(pinned: &[u8], presented: Option<&[u8]>) -> ReplicatorResult<()> {
    let Some(presented) = presented else {
        return Err(ReplicatorError::CertificateMismatch(
            "peer presented no certificate".into(),
        ));
    };
    let expected = certificate_fingerprint(pinned);
    let actual = certificate_fingerprint(presented);
    if expected != actual {
        return Err(ReplicatorError::CertificateMismatch(format!(
            "expected {}, got {}",
            hex::encode(expected),
            hex::encode(actual)
        )));
    }
    Ok(())
}

/// Reply to a [`TransferSession::receive_batch`] request.
#[derive(Debug, Default)]
pub struct ReceivedRevisions {
    /// Revisions the peer sent, in request order.
    pub revisions: Vec<RevisionPayload>,
    /// Requests the peer refused, with the reason.
    pub refused: Vec<DocumentResult>,
    /// The peer stopped early to stay under the frame limit.
    pub truncated: bool,
}

/// An open, authenticated session with a peer.
pub struct TransferSession {
    connection: Box<dyn Connection>,
    peer_id: String,
    session_cookie: Option<String>,
}

impl TransferSession {
    /// Connects, verifies the pinned certificate and performs the handshake.
    pub fn open(
        connector: &dyn Connector,
        config: &ReplicatorConfiguration,
        client_id: &str,
    ) -> ReplicatorResult<Self> {
        let options = ConnectOptions {
            timeout: config.timeout,
            max_frame_len: config.max_frame_len,
            pinned_certificate: config.pinned_certificate.clone(),
        };
        let mut connection = connector.connect(&config.endpoint, &options)?;

        if let Some(pinned) = &config.pinned_certificate {
            let presented = connection.peer_certificate();
            if let Err(err) = verify_pinned_certificate(pinned, presented.as_deref()) {
                warn!(endpoint = %config.endpoint, error = %err, "certificate rejected");
                let _ = connection.close();
                return Err(err);
            }
        }

        let mut hello = Hello::new(client_id, config.endpoint.database_name());
        hello.headers = config.headers.clone();
        hello.max_frame_len = u64::try_from(config.max_frame_len).unwrap_or(u64::MAX);
        if let Some(authenticator) = &config.authenticator {
            authenticator.apply(&mut hello.headers);
        }

        let reply = match connection.request(&Message::Hello(hello))? {
            Message::HelloReply(reply) => reply,
            Message::Error(error) => return Err(ReplicatorError::from_wire(error)),
            other => return Err(unexpected("HelloReply", &other)),
        };
        if !reply.accepted {
            let _ = connection.close();
            return Err(match reply.error {
                Some(error) => ReplicatorError::from_wire(error),
                None => ReplicatorError::Protocol("handshake refused without a reason".into()),
            });
        }

        info!(endpoint = %config.endpoint, peer_id = %reply.peer_id, "session opened");
        Ok(Self {
            connection,
            peer_id: reply.peer_id,
            session_cookie: reply.session,
        })
    }

    /// Identity the peer reported.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Session cookie the peer issued in exchange for basic credentials.
    pub fn session_cookie(&self) -> Option<&str> {
        self.session_cookie.as_deref()
    }

    /// Fetches the peer's copy of a checkpoint.
    pub fn get_checkpoint(&mut self, checkpoint_id: &str) -> ReplicatorResult<Option<Checkpoint>> {
        let reply = self.call(Message::GetCheckpoint {
            checkpoint_id: checkpoint_id.to_string(),
        })?;
        match reply {
            Message::CheckpointReply { checkpoint } => checkpoint
                .map(|bytes| Checkpoint::from_bytes(&bytes))
                .transpose()
                .map_err(|e| ReplicatorError::Protocol(format!("bad remote checkpoint: {e}"))),
            other => Err(unexpected("CheckpointReply", &other)),
        }
    }

    /// Mirrors a checkpoint to the peer.
    pub fn set_checkpoint(
        &mut self,
        checkpoint_id: &str,
        checkpoint: &Checkpoint,
    ) -> ReplicatorResult<()> {
        let reply = self.call(Message::SetCheckpoint {
            checkpoint_id: checkpoint_id.to_string(),
            checkpoint: checkpoint.to_bytes()?,
        })?;
        match reply {
            Message::Ack => Ok(()),
            other => Err(unexpected("Ack", &other)),
        }
    }

    /// Requests the next window of the peer's changes feed.
    pub fn changes(&mut self, request: SubChanges) -> ReplicatorResult<ChangesBatch> {
        match self.call(Message::SubChanges(request))? {
            Message::Changes(batch) => Ok(batch),
            other => Err(unexpected("Changes", &other)),
        }
    }

    /// Asks which of the proposed revisions the peer lacks.
    pub fn revs_diff(
        &mut self,
        proposed: Vec<ProposedRevision>,
    ) -> ReplicatorResult<Vec<MissingRevision>> {
        match self.call(Message::RevsDiff { proposed })? {
            Message::RevsDiffReply { missing } => Ok(missing),
            other => Err(unexpected("RevsDiffReply", &other)),
        }
    }

    /// Fetches a window of revisions with their histories. The peer may
    /// answer only a prefix of the window; see [`ReceivedRevisions`].
    pub fn receive_batch(
        &mut self,
        requests: Vec<RevisionRequest>,
    ) -> ReplicatorResult<ReceivedRevisions> {
        match self.call(Message::GetRevs { requests })? {
            Message::Revs {
                revisions,
                refused,
                truncated,
            } => Ok(ReceivedRevisions {
                revisions,
                refused,
                truncated,
            }),
            other => Err(unexpected("Revs", &other)),
        }
    }

    /// Sends a window of revisions; returns the per-document results.
    pub fn send_batch(
        &mut self,
        revisions: Vec<RevisionPayload>,
    ) -> ReplicatorResult<Vec<DocumentResult>> {
        match self.call(Message::PushRevs { revisions })? {
            Message::PushReply { results } => Ok(results),
            other => Err(unexpected("PushReply", &other)),
        }
    }

    /// Says goodbye and drops the connection.
    pub fn close(mut self) -> ReplicatorResult<()> {
        let result = match self.connection.request(&Message::Close) {
            Ok(Message::Ack) => Ok(()),
            Ok(other) => Err(unexpected("Ack", &other)),
            Err(err) => Err(err),
        };
        let closed = self.connection.close();
        debug!(peer_id = %self.peer_id, "session closed");
        result.and(closed)
    }

    fn call(&mut self, message: Message) -> ReplicatorResult<Message> {
        match self.connection.request(&message)? {
            Message::Error(error) => Err(ReplicatorError::from_wire(error)),
            reply => Ok(reply),
        }
    }
}

fn unexpected(expected: &str, actual: &Message) -> ReplicatorError {
    ReplicatorError::Protocol(format!("expected {expected}, got {}", actual.kind()))
}

//! Request handling for replication sessions.
//!
//! A [`PeerHandler`] owns the database and configuration shared by every
//! connection; each connection gets its own [`PeerSession`], which tracks the
//! handshake and turns one request message into one reply.

use crate::auth::{find_cookie, parse_basic_auth, SessionIssuer};
use crate::config::PeerConfig;
use crate::error::{PeerError, PeerResult};
use docsync_core::{
    decode_properties, ChangeEntry, Checkpoint, CoreError, Database, Properties, Revision,
};
use docsync_protocol::{
    missing_revisions, trim_history, Change, ChangesBatch, DocumentResult, ErrorCode,
    FrameBudget, Hello, HelloReply, Message, RevisionPayload, RevisionRequest, SubChanges,
    WireError, PROTOCOL_VERSION,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Property listing the channels a document belongs to.
pub const CHANNELS_PROPERTY: &str = "channels";

const CHECKPOINT_PREFIX: &str = "peer-checkpoint/";

/// Channels a document is in, read from its `channels` property (a string
/// or an array of strings).
pub fn document_channels(properties: &Properties) -> Vec<String> {
    match properties.get(CHANNELS_PROPERTY) {
        Some(Value::String(channel)) => vec![channel.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelFilter {
    All,
    Only(HashSet<String>),
}

impl ChannelFilter {
    /// Combines a user's grants with the channels a request asks for.
    fn new(granted: &[String], requested: &[String]) -> Self {
        match (granted.is_empty(), requested.is_empty()) {
            (true, true) => ChannelFilter::All,
            (true, false) => ChannelFilter::Only(requested.iter().cloned().collect()),
            (false, true) => ChannelFilter::Only(granted.iter().cloned().collect()),
            (false, false) => ChannelFilter::Only(
                requested
                    .iter()
                    .filter(|channel| granted.contains(channel))
                    .cloned()
                    .collect(),
            ),
        }
    }

    fn admits(&self, properties: &Properties) -> bool {
        match self {
            ChannelFilter::All => true,
            ChannelFilter::Only(channels) => document_channels(properties)
                .iter()
                .any(|channel| channels.contains(channel)),
        }
    }

    fn admits_revision(&self, revision: &Revision) -> PeerResult<bool> {
        if revision.deleted {
            return Ok(false);
        }
        Ok(self.admits(&revision.properties()?))
    }
}

enum Visibility {
    Visible,
    AccessRemoved,
    Hidden,
}

#[derive(Debug, Clone)]
struct Principal {
    username: Option<String>,
    channels: Vec<String>,
}

impl Principal {
    fn anonymous() -> Self {
        Self {
            username: None,
            channels: Vec::new(),
        }
    }
}

/// Shared request handler for one database.
pub struct PeerHandler {
    db: Database,
    config: PeerConfig,
    sessions: SessionIssuer,
}

impl PeerHandler {
    /// Creates a handler serving `db`.
    pub fn new(db: Database, config: PeerConfig) -> Arc<Self> {
        let sessions = SessionIssuer::new(config.session_secret.clone(), config.session_expiry);
        Arc::new(Self {
            db,
            config,
            sessions,
        })
    }

    /// The served database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Peer configuration.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Identity reported in handshakes.
    pub fn peer_id(&self) -> String {
        self.db.uuid().to_string()
    }

    /// Certificate presented to clients.
    pub fn certificate(&self) -> Option<&[u8]> {
        self.config.certificate.as_deref()
    }

    /// Issues a session cookie value for a configured user.
    pub fn issue_session(&self, username: &str) -> PeerResult<String> {
        if !self.config.users.contains_key(username) {
            return Err(PeerError::AuthenticationFailed(format!(
                "unknown user {username}"
            )));
        }
        self.sessions.issue(username)
    }

    /// Starts a session for a new connection.
    pub fn session(self: &Arc<Self>) -> PeerSession {
        PeerSession {
            handler: Arc::clone(self),
            principal: None,
            client_id: String::new(),
            max_reply_len: self.config.max_frame_len,
            closed: false,
        }
    }

    fn authenticate(&self, hello: &Hello) -> PeerResult<(Principal, Option<String>)> {
        if !self.config.require_auth {
            return Ok((Principal::anonymous(), None));
        }

        let (username, issued) = if let Some(header) = hello.header("Authorization") {
            let (username, password) = parse_basic_auth(header).ok_or_else(|| {
                PeerError::AuthenticationFailed("malformed authorization header".into())
            })?;
            let known = self
                .config
                .users
                .get(&username)
                .is_some_and(|access| access.password == password);
            if !known {
                return Err(PeerError::AuthenticationFailed(format!(
                    "invalid credentials for {username}"
                )));
            }
            let session = self.sessions.issue(&username)?;
            (username, Some(session))
        } else if let Some(cookie) = hello
            .header("Cookie")
            .and_then(|header| find_cookie(header, &self.config.cookie_name))
        {
            (self.sessions.verify(cookie)?, None)
        } else {
            return Err(PeerError::AuthenticationFailed(
                "credentials required".into(),
            ));
        };

        let access = self
            .config
            .users
            .get(&username)
            .ok_or_else(|| PeerError::AuthenticationFailed(format!("unknown user {username}")))?;
        if access.disabled {
            return Err(PeerError::Forbidden(format!("user {username} is disabled")));
        }
        Ok((
            Principal {
                username: Some(username),
                channels: access.channels.clone(),
            },
            issued,
        ))
    }

    fn visibility(&self, entry: &ChangeEntry, filter: &ChannelFilter) -> PeerResult<Visibility> {
        if *filter == ChannelFilter::All {
            return Ok(Visibility::Visible);
        }
        if let Some(current) = self.db.read_revision_at(&entry.doc_id, &entry.revision_id)? {
            if filter.admits_revision(&current)? {
                return Ok(Visibility::Visible);
            }
        }
        let history = self.db.revision_history(&entry.doc_id, &entry.revision_id);
        let mut was_visible = false;
        for ancestor in history.iter().skip(1) {
            if let Some(revision) = self.db.read_revision_at(&entry.doc_id, ancestor)? {
                if filter.admits_revision(&revision)? {
                    was_visible = true;
                    break;
                }
            }
        }
        Ok(match (was_visible, entry.deleted) {
            (false, _) => Visibility::Hidden,
            (true, true) => Visibility::Visible,
            (true, false) => Visibility::AccessRemoved,
        })
    }

    fn changes(
        &self,
        principal: &Principal,
        request: &SubChanges,
        max_reply_len: usize,
    ) -> PeerResult<ChangesBatch> {
        let limit = request.limit.clamp(1, self.config.max_changes_batch.max(1)) as usize;
        let filter = ChannelFilter::new(&principal.channels, &request.channels);
        let doc_ids: HashSet<&str> = request.doc_ids.iter().map(String::as_str).collect();
        let shape = |changes: Vec<Change>| {
            Message::Changes(ChangesBatch {
                changes,
                last_sequence: u64::MAX,
                caught_up: false,
            })
        };
        let mut budget = FrameBudget::new(max_reply_len, &shape(Vec::new()))?;

        let mut cursor = request.since;
        let mut changes = Vec::new();
        'scan: loop {
            let window = self.db.changes_since(cursor, limit);
            if window.is_empty() {
                break;
            }
            for entry in window {
                let previous = cursor;
                cursor = entry.sequence;
                if !doc_ids.is_empty() && !doc_ids.contains(entry.doc_id.as_str()) {
                    continue;
                }
                let access_removed = match self.visibility(&entry, &filter)? {
                    Visibility::Visible => false,
                    Visibility::AccessRemoved => true,
                    Visibility::Hidden => continue,
                };
                let change = Change {
                    sequence: entry.sequence,
                    doc_id: entry.doc_id,
                    revision_id: entry.revision_id,
                    deleted: entry.deleted,
                    access_removed,
                };
                let cost = budget.cost_of(&shape(vec![change.clone()]))?;
                if !budget.try_reserve(cost) && !changes.is_empty() {
                    // Left for the next window.
                    cursor = previous;
                    break 'scan;
                }
                changes.push(change);
                if changes.len() >= limit {
                    break 'scan;
                }
            }
        }

        Ok(ChangesBatch {
            changes,
            last_sequence: cursor,
            caught_up: cursor >= self.db.last_sequence(),
        })
    }

    fn revs(
        &self,
        principal: &Principal,
        requests: &[RevisionRequest],
        max_reply_len: usize,
    ) -> PeerResult<Message> {
        let readable = ChannelFilter::new(&principal.channels, &[]);
        let max_history = self.db.config().max_history;
        let shape = |revisions: Vec<RevisionPayload>, refused: Vec<DocumentResult>| {
            Message::Revs {
                revisions,
                refused,
                truncated: true,
            }
        };
        let mut budget = FrameBudget::new(max_reply_len, &shape(Vec::new(), Vec::new()))?;
        let mut revisions = Vec::with_capacity(requests.len());
        let mut refused = Vec::new();
        let mut truncated = false;
        for request in requests {
            let Some(revision) = self
                .db
                .read_revision_at(&request.doc_id, &request.revision_id)?
            else {
                debug!(doc_id = %request.doc_id, revision = %request.revision_id, "revision gone");
                continue;
            };
            if !revision.deleted && !readable.admits_revision(&revision)? {
                return Err(PeerError::Forbidden(format!(
                    "no read access to {}",
                    request.doc_id
                )));
            }
            let history = self
                .db
                .revision_history(&request.doc_id, &request.revision_id);
            let payload = RevisionPayload {
                doc_id: revision.doc_id,
                history: trim_history(&history, &request.known_ancestors, max_history),
                deleted: revision.deleted,
                body: revision.body,
            };

            let cost = budget.cost_of(&shape(vec![payload.clone()], Vec::new()))?;
            if budget.exceeds_alone(cost) {
                let too_large = DocumentResult::failed(
                    request.doc_id.clone(),
                    request.revision_id.clone(),
                    WireError::new(
                        ErrorCode::TooLarge,
                        format!("revision needs {cost} bytes, frame limit is {max_reply_len}"),
                    ),
                );
                let cost = budget.cost_of(&shape(Vec::new(), vec![too_large.clone()]))?;
                if !budget.try_reserve(cost) {
                    truncated = true;
                    break;
                }
                debug!(doc_id = %request.doc_id, cost, "revision too large to send");
                refused.push(too_large);
                continue;
            }
            if !budget.try_reserve(cost) {
                truncated = true;
                break;
            }
            revisions.push(payload);
        }
        Ok(Message::Revs {
            revisions,
            refused,
            truncated,
        })
    }

    fn push(
        &self,
        principal: &Principal,
        revisions: Vec<RevisionPayload>,
    ) -> PeerResult<Vec<DocumentResult>> {
        if revisions.len() > self.config.max_push_batch as usize {
            return Err(PeerError::InvalidRequest(format!(
                "too many revisions: {} > {}",
                revisions.len(),
                self.config.max_push_batch
            )));
        }
        if revisions.iter().any(|payload| payload.history.is_empty()) {
            return Err(PeerError::InvalidRequest("revision without history".into()));
        }

        let writable = ChannelFilter::new(&principal.channels, &[]);
        let mut results = Vec::with_capacity(revisions.len());
        for payload in revisions {
            let Some(revision_id) = payload.revision_id().cloned() else {
                continue;
            };
            if !payload.deleted && writable != ChannelFilter::All {
                let allowed = decode_properties(&payload.body)
                    .map(|properties| writable.admits(&properties))
                    .unwrap_or(false);
                if !allowed {
                    results.push(DocumentResult::failed(
                        payload.doc_id,
                        revision_id,
                        WireError::new(ErrorCode::Forbidden, "no write access"),
                    ));
                    continue;
                }
            }
            let result = match self
                .db
                .insert_revision(&payload.to_insert(), self.config.allow_conflicts)
            {
                Ok(_) => DocumentResult::ok(payload.doc_id, revision_id),
                Err(err) => {
                    debug!(doc_id = %payload.doc_id, error = %err, "push refused");
                    let wire = PeerError::Database(err).to_wire();
                    DocumentResult::failed(payload.doc_id, revision_id, wire)
                }
            };
            results.push(result);
        }
        Ok(results)
    }
}

/// One client's conversation with the peer.
pub struct PeerSession {
    handler: Arc<PeerHandler>,
    principal: Option<Principal>,
    client_id: String,
    max_reply_len: usize,
    closed: bool,
}

impl PeerSession {
    /// Handles one request and returns the reply.
    pub fn handle(&mut self, message: Message) -> Message {
        let kind = message.kind();
        match self.dispatch(message) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(client = %self.client_id, kind, error = %err, "request failed");
                Message::Error(err.to_wire())
            }
        }
    }

    /// True after the client closed the session.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True after a successful handshake.
    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    fn hello(&mut self, hello: &Hello) -> HelloReply {
        if hello.protocol_version != PROTOCOL_VERSION {
            return HelloReply::refused(WireError::new(
                ErrorCode::VersionMismatch,
                format!("unsupported protocol version {}", hello.protocol_version),
            ));
        }
        if let Some(name) = &self.handler.config.database_name {
            if *name != hello.database {
                return HelloReply::refused(WireError::new(
                    ErrorCode::NotFound,
                    format!("no database named {}", hello.database),
                ));
            }
        }
        match self.handler.authenticate(hello) {
            Ok((principal, session)) => {
                info!(
                    client = %hello.client_id,
                    user = principal.username.as_deref().unwrap_or("<anonymous>"),
                    "session accepted"
                );
                self.principal = Some(principal);
                self.client_id = hello.client_id.clone();
                self.max_reply_len = match usize::try_from(hello.max_frame_len) {
                    Ok(0) | Err(_) => self.handler.config.max_frame_len,
                    Ok(client) => client.min(self.handler.config.max_frame_len),
                };
                let mut reply = HelloReply::accepted(self.handler.peer_id());
                reply.session = session;
                reply
            }
            Err(err) => {
                warn!(client = %hello.client_id, error = %err, "session refused");
                HelloReply::refused(err.to_wire())
            }
        }
    }

    fn dispatch(&mut self, message: Message) -> PeerResult<Message> {
        if let Message::Hello(hello) = &message {
            return Ok(Message::HelloReply(self.hello(hello)));
        }
        let principal = self
            .principal
            .clone()
            .ok_or_else(|| PeerError::AuthenticationFailed("handshake required".into()))?;
        let handler = Arc::clone(&self.handler);
        let db = &handler.db;

        match message {
            Message::GetCheckpoint { checkpoint_id } => Ok(Message::CheckpointReply {
                checkpoint: db.get_local(&format!("{CHECKPOINT_PREFIX}{checkpoint_id}")),
            }),
            Message::SetCheckpoint {
                checkpoint_id,
                checkpoint,
            } => {
                Checkpoint::from_bytes(&checkpoint)
                    .map_err(|e: CoreError| PeerError::InvalidRequest(e.to_string()))?;
                db.put_local(&format!("{CHECKPOINT_PREFIX}{checkpoint_id}"), checkpoint);
                Ok(Message::Ack)
            }
            Message::SubChanges(request) => Ok(Message::Changes(handler.changes(
                &principal,
                &request,
                self.max_reply_len,
            )?)),
            Message::RevsDiff { proposed } => Ok(Message::RevsDiffReply {
                missing: missing_revisions(&proposed, |doc_id| db.known_revisions(doc_id)),
            }),
            Message::GetRevs { requests } => handler.revs(&principal, &requests, self.max_reply_len),
            Message::PushRevs { revisions } => Ok(Message::PushReply {
                results: handler.push(&principal, revisions)?,
            }),
            Message::Close => {
                debug!(client = %self.client_id, "session closed");
                self.closed = true;
                Ok(Message::Ack)
            }
            other => Err(PeerError::InvalidRequest(format!(
                "unexpected {} message",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserAccess;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use docsync_core::MutableDocument;
    use docsync_protocol::ProposedRevision;

    fn accepted_session(handler: &Arc<PeerHandler>) -> PeerSession {
        let mut session = handler.session();
        let reply = session.handle(Message::Hello(Hello::new("client", "db")));
        assert!(matches!(reply, Message::HelloReply(HelloReply { accepted: true, .. })));
        session
    }

    fn save(db: &Database, id: &str, channels: &[&str]) {
        let mut doc = db
            .get_mutable_document(id)
            .unwrap()
            .unwrap_or_else(|| MutableDocument::new(id));
        doc.set("channels", channels.to_vec());
        db.save_document(&mut doc).unwrap();
    }

    fn sub(since: u64, channels: &[&str]) -> Message {
        Message::SubChanges(SubChanges {
            since,
            limit: 100,
            channels: channels.iter().map(|c| c.to_string()).collect(),
            doc_ids: Vec::new(),
        })
    }

    fn changes(reply: Message) -> ChangesBatch {
        match reply {
            Message::Changes(batch) => batch,
            other => panic!("expected Changes, got {other:?}"),
        }
    }

    #[test]
    fn requests_before_handshake_are_refused() {
        let handler = PeerHandler::new(Database::open_in_memory("p").unwrap(), PeerConfig::new());
        let mut session = handler.session();
        let reply = session.handle(sub(0, &[]));
        assert!(matches!(
            reply,
            Message::Error(WireError {
                code: ErrorCode::Unauthorized,
                ..
            })
        ));
    }

    #[test]
    fn basic_login_issues_a_session_cookie() {
        let config = PeerConfig::new().with_user("pupshaw", UserAccess::new("frank"));
        let handler = PeerHandler::new(Database::open_in_memory("p").unwrap(), config);

        let mut hello = Hello::new("client", "db");
        hello.headers.insert(
            "Authorization".into(),
            format!("Basic {}", STANDARD.encode("pupshaw:frank")),
        );
        let Message::HelloReply(reply) = handler.session().handle(Message::Hello(hello)) else {
            panic!("expected HelloReply");
        };
        assert!(reply.accepted);
        let cookie = reply.session.unwrap();

        let mut hello = Hello::new("client", "db");
        hello
            .headers
            .insert("Cookie".into(), format!("SyncGatewaySession={cookie}"));
        let Message::HelloReply(reply) = handler.session().handle(Message::Hello(hello)) else {
            panic!("expected HelloReply");
        };
        assert!(reply.accepted);
    }

    #[test]
    fn bad_credentials_and_disabled_users() {
        let config = PeerConfig::new()
            .with_user("pupshaw", UserAccess::new("frank"))
            .with_user("ghost", UserAccess::new("boo").disabled());
        let handler = PeerHandler::new(Database::open_in_memory("p").unwrap(), config);

        let refused = |user: &str, password: &str| {
            let mut hello = Hello::new("client", "db");
            hello.headers.insert(
                "Authorization".into(),
                format!("Basic {}", STANDARD.encode(format!("{user}:{password}"))),
            );
            match handler.session().handle(Message::Hello(hello)) {
                Message::HelloReply(reply) => reply.error.map(|e| e.code),
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(refused("pupshaw", "wrong"), Some(ErrorCode::Unauthorized));
        assert_eq!(refused("ghost", "boo"), Some(ErrorCode::Forbidden));
        assert_eq!(refused("pupshaw", "frank"), None);

        let Message::HelloReply(reply) =
            handler.session().handle(Message::Hello(Hello::new("c", "db")))
        else {
            panic!("expected HelloReply");
        };
        assert_eq!(reply.error.map(|e| e.code), Some(ErrorCode::Unauthorized));
    }

    #[test]
    fn wrong_database_name_is_not_found() {
        let config = PeerConfig::new().with_database_name("travel");
        let handler = PeerHandler::new(Database::open_in_memory("p").unwrap(), config);
        let Message::HelloReply(reply) = handler
            .session()
            .handle(Message::Hello(Hello::new("c", "other")))
        else {
            panic!("expected HelloReply");
        };
        assert_eq!(reply.error.map(|e| e.code), Some(ErrorCode::NotFound));
    }

    #[test]
    fn changes_feed_filters_channels_and_reports_access_removal() {
        let db = Database::open_in_memory("p").unwrap();
        save(&db, "a", &["red"]);
        save(&db, "b", &["blue"]);
        save(&db, "c", &["red"]);
        let handler = PeerHandler::new(db.clone(), PeerConfig::new());
        let mut session = accepted_session(&handler);

        let batch = changes(session.handle(sub(0, &["red"])));
        let ids: Vec<_> = batch.changes.iter().map(|c| c.doc_id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);
        assert_eq!(batch.last_sequence, 3);
        assert!(batch.caught_up);

        // "a" moves out of red.
        save(&db, "a", &["blue"]);
        let batch = changes(session.handle(sub(3, &["red"])));
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].doc_id, "a");
        assert!(batch.changes[0].access_removed);
    }

    #[test]
    fn changes_feed_pages_by_limit() {
        let db = Database::open_in_memory("p").unwrap();
        for n in 0..5 {
            save(&db, &format!("d{n}"), &[]);
        }
        let handler = PeerHandler::new(db, PeerConfig::new().with_max_changes_batch(2));
        let mut session = accepted_session(&handler);

        let first = changes(session.handle(sub(0, &[])));
        assert_eq!(first.changes.len(), 2);
        assert!(!first.caught_up);
        let second = changes(session.handle(sub(first.last_sequence, &[])));
        assert_eq!(second.changes[0].doc_id, "d2");
    }

    #[test]
    fn checkpoints_are_stored_per_id() {
        let handler = PeerHandler::new(Database::open_in_memory("p").unwrap(), PeerConfig::new());
        let mut session = accepted_session(&handler);
        let bytes = Checkpoint { local: 4, remote: 9 }.to_bytes().unwrap();

        assert_eq!(
            session.handle(Message::GetCheckpoint {
                checkpoint_id: "x".into()
            }),
            Message::CheckpointReply { checkpoint: None }
        );
        assert_eq!(
            session.handle(Message::SetCheckpoint {
                checkpoint_id: "x".into(),
                checkpoint: bytes.clone(),
            }),
            Message::Ack
        );
        assert_eq!(
            session.handle(Message::GetCheckpoint {
                checkpoint_id: "x".into()
            }),
            Message::CheckpointReply {
                checkpoint: Some(bytes)
            }
        );
    }

    #[test]
    fn push_refuses_conflicts_unless_allowed() {
        let db = Database::open_in_memory("p").unwrap();
        save(&db, "doc", &[]);
        let base = db.read_revision("doc").unwrap().unwrap().revision_id;
        let handler = PeerHandler::new(db.clone(), PeerConfig::new());
        let mut session = accepted_session(&handler);

        let mut other = RevisionPayload {
            doc_id: "doc".into(),
            history: vec![docsync_core::RevisionId::derive(None, false, b"x").unwrap()],
            deleted: false,
            body: Vec::new(),
        };
        let Message::PushReply { results } = session.handle(Message::PushRevs {
            revisions: vec![other.clone()],
        }) else {
            panic!("expected PushReply");
        };
        assert_eq!(
            results[0].error.as_ref().map(|e| e.code),
            Some(ErrorCode::Conflict)
        );

        other.history = vec![docsync_core::RevisionId::derive(Some(&base), false, b"").unwrap(), base];
        let Message::PushReply { results } = session.handle(Message::PushRevs {
            revisions: vec![other],
        }) else {
            panic!("expected PushReply");
        };
        assert!(results[0].error.is_none());
        assert_eq!(db.read_revision("doc").unwrap().unwrap().revision_id.generation(), 2);
    }

    #[test]
    fn revs_diff_and_get_revs() {
        let db = Database::open_in_memory("p").unwrap();
        save(&db, "doc", &[]);
        save(&db, "doc", &["x"]);
        let current = db.read_revision("doc").unwrap().unwrap().revision_id;
        let handler = PeerHandler::new(db.clone(), PeerConfig::new());
        let mut session = accepted_session(&handler);

        let Message::RevsDiffReply { missing } = session.handle(Message::RevsDiff {
            proposed: vec![ProposedRevision {
                doc_id: "doc".into(),
                revision_id: current.clone(),
            }],
        }) else {
            panic!("expected RevsDiffReply");
        };
        assert!(missing.is_empty());

        let Message::Revs { revisions, .. } = session.handle(Message::GetRevs {
            requests: vec![RevisionRequest {
                doc_id: "doc".into(),
                revision_id: current.clone(),
                known_ancestors: Vec::new(),
            }],
        }) else {
            panic!("expected Revs");
        };
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].history.len(), 2);
        assert_eq!(revisions[0].revision_id(), Some(&current));
    }

    fn request_for(db: &Database, id: &str) -> RevisionRequest {
        RevisionRequest {
            doc_id: id.into(),
            revision_id: db.read_revision(id).unwrap().unwrap().revision_id,
            known_ancestors: Vec::new(),
        }
    }

    #[test]
    fn replies_stay_under_the_client_frame_limit() {
        let db = Database::open_in_memory("p").unwrap();
        for n in 0..40 {
            save(&db, &format!("doc-{n:02}"), &[]);
        }
        let mut big = MutableDocument::new("big");
        big.set("blob", "x".repeat(4096));
        db.save_document(&mut big).unwrap();

        let handler = PeerHandler::new(db.clone(), PeerConfig::new());
        let mut session = handler.session();
        let mut hello = Hello::new("client", "db");
        hello.max_frame_len = 1024;
        session.handle(Message::Hello(hello));

        let reply = session.handle(sub(0, &[]));
        assert!(reply.encode().unwrap().len() <= 1024);
        let Message::Changes(batch) = reply else {
            panic!("expected Changes");
        };
        assert!(!batch.changes.is_empty() && batch.changes.len() < 41);
        assert!(!batch.caught_up);
        assert_eq!(
            batch.last_sequence,
            batch.changes.last().map(|c| c.sequence).unwrap()
        );

        let requests = vec![
            request_for(&db, "doc-00"),
            request_for(&db, "big"),
            request_for(&db, "doc-01"),
        ];
        let Message::Revs {
            revisions,
            refused,
            truncated,
        } = session.handle(Message::GetRevs { requests })
        else {
            panic!("expected Revs");
        };
        let sent: Vec<&str> = revisions.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(sent, ["doc-00", "doc-01"]);
        assert_eq!(refused.len(), 1);
        assert_eq!(refused[0].doc_id, "big");
        assert_eq!(refused[0].error.as_ref().map(|e| e.code), Some(ErrorCode::TooLarge));
        assert!(!truncated);

        let requests: Vec<RevisionRequest> = (0..40)
            .map(|n| request_for(&db, &format!("doc-{n:02}")))
            .collect();
        let reply = session.handle(Message::GetRevs { requests });
        assert!(reply.encode().unwrap().len() <= 1024);
        let Message::Revs {
            revisions,
            truncated,
            ..
        } = reply
        else {
            panic!("expected Revs");
        };
        assert!(truncated);
        assert!(!revisions.is_empty() && revisions.len() < 40);
    }

    #[test]
    fn channel_restricted_user_cannot_push_elsewhere() {
        let config = PeerConfig::new()
            .with_user("pupshaw", UserAccess::new("frank").with_channels(["red"]));
        let db = Database::open_in_memory("p").unwrap();
        let handler = PeerHandler::new(db, config);
        let mut session = handler.session();
        let mut hello = Hello::new("client", "db");
        hello.headers.insert(
            "Authorization".into(),
            format!("Basic {}", STANDARD.encode("pupshaw:frank")),
        );
        session.handle(Message::Hello(hello));
        assert!(session.is_authenticated());

        let mut props = Properties::new();
        props.insert("channels".into(), serde_json::json!(["blue"]));
        let body = docsync_core::encode_properties(&props).unwrap();
        let payload = RevisionPayload {
            doc_id: "doc".into(),
            history: vec![docsync_core::RevisionId::derive(None, false, &body).unwrap()],
            deleted: false,
            body,
        };
        let Message::PushReply { results } = session.handle(Message::PushRevs {
            revisions: vec![payload],
        }) else {
            panic!("expected PushReply");
        };
        assert_eq!(
            results[0].error.as_ref().map(|e| e.code),
            Some(ErrorCode::Forbidden)
        );
    }
}

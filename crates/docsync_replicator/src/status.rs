//! Replicator status and per-document reports.

use crate::error::ReplicatorError;

/// What a replicator is doing, ordered from least to most active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActivityLevel {
    /// Not running.
    Stopped,
    /// Waiting to retry after a transient error.
    Offline,
    /// Opening a session.
    Connecting,
    /// Caught up; waiting for changes (continuous only).
    Idle,
    /// Transferring changes.
    Busy,
}

/// Change counts for the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Changes processed.
    pub completed: u64,
    /// Changes discovered.
    pub total: u64,
}

/// Snapshot handed to status listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorStatus {
    /// Current activity.
    pub activity: ActivityLevel,
    /// Progress since the last start.
    pub progress: Progress,
    /// The most recent error, if any.
    pub error: Option<ReplicatorError>,
}

impl ReplicatorStatus {
    pub(crate) fn stopped() -> Self {
        Self {
            activity: ActivityLevel::Stopped,
            progress: Progress::default(),
            error: None,
        }
    }
}

/// Flags describing a replicated revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentFlags {
    /// The revision is a deletion.
    pub deleted: bool,
    /// The user lost access to the document on the peer.
    pub access_removed: bool,
    /// Storing the revision left the document with competing branches.
    pub conflicted: bool,
}

/// Outcome for one document in a replicated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedDocument {
    /// Document ID.
    pub id: String,
    /// Revision flags.
    pub flags: DocumentFlags,
    /// Why the document was not replicated, if it was not.
    pub error: Option<ReplicatorError>,
}

/// Direction of a batch of replicated documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local changes sent to the peer.
    Push,
    /// Peer changes applied locally.
    Pull,
}

/// A batch of document outcomes delivered to document listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentReplication {
    /// Batch direction.
    pub direction: Direction,
    /// One entry per document.
    pub documents: Vec<ReplicatedDocument>,
}

impl DocumentReplication {
    /// True for pushed batches.
    pub fn is_push(&self) -> bool {
        self.direction == Direction::Push
    }
}

/// Status listener callback.
pub type ChangeListener = dyn Fn(&ReplicatorStatus) + Send + Sync;

/// Document listener callback.
pub type DocumentListener = dyn Fn(&DocumentReplication) + Send + Sync;

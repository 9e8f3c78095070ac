//! Revision identifiers and the records the store hands out about them.
//!
//! A revision ID has the form `<generation>-<digest>`. The generation is the
//! depth of the revision in its document's history (1 for a root), the digest
//! is derived from the parent, the deletion flag and the encoded body, so two
//! peers making the same edit to the same parent produce the same ID.
//!
//! Revision IDs are totally ordered: higher generation first, then the digest
//! compared lexicographically. Every peer picks the same winner among
//! conflicting leaves this way without coordinating.

use crate::error::{CoreError, CoreResult};
use crate::codec::decode_properties;
use crate::document::Properties;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Number of hex characters kept from the SHA-256 digest.
const DIGEST_HEX_LEN: usize = 40;

/// Identifier of one revision of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId {
    generation: u64,
    digest: String,
}

impl RevisionId {
    /// Creates a revision ID from its parts.
    pub fn new(generation: u64, digest: impl Into<String>) -> CoreResult<Self> {
        let digest = digest.into();
        if generation == 0 {
            return Err(CoreError::InvalidRevision(
                "generation must be at least 1".into(),
            ));
        }
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::InvalidRevision(format!(
                "digest {digest:?} must be non-empty alphanumeric"
            )));
        }
        Ok(Self { generation, digest })
    }

    /// Derives the ID of a new revision written on top of `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRevision`] when the parent's generation
    /// is already at the maximum.
    pub fn derive(parent: Option<&RevisionId>, deleted: bool, body: &[u8]) -> CoreResult<Self> {
        let generation = match parent {
            Some(parent) => parent.generation.checked_add(1).ok_or_else(|| {
                CoreError::InvalidRevision(format!("{parent} has no room for a child"))
            })?,
            None => 1,
        };
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([0u8, u8::from(deleted)]);
        hasher.update(body);
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(DIGEST_HEX_LEN);
        Ok(Self { generation, digest })
    }

    /// Returns the generation (history depth).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest part.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| CoreError::InvalidRevision(format!("{s:?} has no generation")))?;
        let generation = generation
            .parse::<u64>()
            .map_err(|_| CoreError::InvalidRevision(format!("{s:?} has a bad generation")))?;
        Self::new(generation, digest)
    }
}

impl Serialize for RevisionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RevisionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// One stored revision of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    /// Document the revision belongs to.
    pub doc_id: String,
    /// The revision's ID.
    pub revision_id: RevisionId,
    /// Parent revision, if known.
    pub parent: Option<RevisionId>,
    /// Sequence of the document's latest change.
    pub sequence: u64,
    /// Whether this revision is a deletion tombstone.
    pub deleted: bool,
    /// Encoded property tree.
    pub body: Vec<u8>,
}

impl Revision {
    /// Decodes the revision's property tree.
    pub fn properties(&self) -> CoreResult<Properties> {
        decode_properties(&self.body)
    }
}

/// One entry of the by-sequence change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Sequence assigned to the document's latest change.
    pub sequence: u64,
    /// The changed document.
    pub doc_id: String,
    /// Current revision of the document.
    pub revision_id: RevisionId,
    /// Whether the current revision is a deletion.
    pub deleted: bool,
}

/// A revision arriving from another database together with its ancestry.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionInsert {
    /// Target document.
    pub doc_id: String,
    /// Revision history, newest first. `history[0]` is the revision to insert.
    pub history: Vec<RevisionId>,
    /// Whether the revision is a deletion.
    pub deleted: bool,
    /// Encoded property tree.
    pub body: Vec<u8>,
}

impl RevisionInsert {
    /// The revision being inserted.
    pub fn revision_id(&self) -> Option<&RevisionId> {
        self.history.first()
    }
}

/// Result of inserting a foreign revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The revision was already present.
    AlreadyKnown,
    /// The revision was added.
    Inserted {
        /// New sequence of the document.
        sequence: u64,
        /// True if the revision started or extended a branch other than the
        /// winning one, leaving the document with competing live leaves.
        conflicted: bool,
    },
}

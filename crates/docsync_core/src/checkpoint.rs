//! Replication checkpoints.
//!
//! A checkpoint records how far a replication pairing got: the last local
//! sequence pushed and the last remote sequence pulled. Checkpoints live in
//! the database's local (non-replicated) documents under `checkpoint/<id>`.
//!
//! Only one replicator may drive a pairing at a time. [`CheckpointStore::lease`]
//! hands out an exclusive [`CheckpointLease`]; a second lease for the same ID
//! fails until the first is dropped.

use crate::codec::{from_cbor, to_cbor};
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

const KEY_PREFIX: &str = "checkpoint/";

/// Replication progress for one pairing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last local sequence whose changes the peer acknowledged.
    pub local: u64,
    /// Last remote sequence whose changes were applied locally.
    pub remote: u64,
}

impl Checkpoint {
    /// Encodes the checkpoint.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes a checkpoint.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        from_cbor(bytes)
    }

    /// The more conservative of two checkpoints, per direction.
    pub fn min(self, other: Checkpoint) -> Checkpoint {
        Checkpoint {
            local: self.local.min(other.local),
            remote: self.remote.min(other.remote),
        }
    }
}

/// Access to the checkpoints stored in a database.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    db: Database,
}

impl CheckpointStore {
    pub(crate) fn new(db: Database) -> Self {
        Self { db }
    }

    fn key(checkpoint_id: &str) -> String {
        format!("{KEY_PREFIX}{checkpoint_id}")
    }

    /// Loads a checkpoint, if one was saved.
    pub fn load(&self, checkpoint_id: &str) -> CoreResult<Option<Checkpoint>> {
        self.db
            .get_local(&Self::key(checkpoint_id))
            .map(|bytes| Checkpoint::from_bytes(&bytes))
            .transpose()
    }

    /// Saves a checkpoint, replacing any previous one.
    pub fn save(&self, checkpoint_id: &str, checkpoint: &Checkpoint) -> CoreResult<()> {
        self.db
            .put_local(&Self::key(checkpoint_id), checkpoint.to_bytes()?);
        debug!(
            checkpoint_id,
            local = checkpoint.local,
            remote = checkpoint.remote,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Discards a checkpoint. Returns true if one existed.
    pub fn reset(&self, checkpoint_id: &str) -> bool {
        self.db.delete_local(&Self::key(checkpoint_id))
    }

    /// Takes exclusive ownership of a pairing.
    pub fn lease(&self, checkpoint_id: &str) -> CoreResult<CheckpointLease> {
        if !self.db.try_lease_checkpoint(checkpoint_id) {
            return Err(CoreError::CheckpointBusy {
                checkpoint_id: checkpoint_id.to_string(),
            });
        }
        Ok(CheckpointLease {
            db: self.db.clone(),
            checkpoint_id: checkpoint_id.to_string(),
        })
    }
}

/// Exclusive use of a checkpoint; released on drop.
#[derive(Debug)]
pub struct CheckpointLease {
    db: Database,
    checkpoint_id: String,
}

impl CheckpointLease {
    /// The leased checkpoint ID.
    pub fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }
}

impl Drop for CheckpointLease {
    fn drop(&mut self) {
        self.db.release_checkpoint(&self.checkpoint_id);
    }
}

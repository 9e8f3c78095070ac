//! Checkpoint identity and the local/remote checkpoint handshake.

use crate::config::ReplicatorConfiguration;
use crate::error::ReplicatorResult;
use crate::session::TransferSession;
use docsync_core::{Checkpoint, CheckpointStore};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Derives the checkpoint ID of a configuration's pairing.
///
/// The ID covers the local database, the endpoint identity and everything
/// that narrows what is replicated, so changing a filter starts over.
/// Filter closures are identified by presence only.
pub fn checkpoint_id(config: &ReplicatorConfiguration) -> String {
    let mut hasher = Sha256::new();
    let mut field = |name: &str, value: &[u8]| {
        hasher.update(name.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    };

    field("db", config.database.uuid().as_bytes());
    field("endpoint", config.endpoint.identity().as_bytes());

    let mut channels: Vec<&str> = config.channels.iter().map(String::as_str).collect();
    channels.sort_unstable();
    channels.dedup();
    field("channels", channels.join("\n").as_bytes());

    let mut doc_ids: Vec<&str> = config.document_ids.iter().map(String::as_str).collect();
    doc_ids.sort_unstable();
    doc_ids.dedup();
    field("doc_ids", doc_ids.join("\n").as_bytes());

    field("push_filter", &[u8::from(config.push_filter.is_some())]);
    field("pull_filter", &[u8::from(config.pull_filter.is_some())]);

    format!("cp-{}", hex::encode(hasher.finalize()))
}

/// Reconciles the local and remote copies of a checkpoint.
///
/// Equal copies are trusted. A missing copy on either side means starting
/// from zero; differing copies fall back to the smaller cursor per
/// direction.
pub fn reconcile(local: Option<Checkpoint>, remote: Option<Checkpoint>) -> Checkpoint {
    match (local, remote) {
        (Some(local), Some(remote)) if local == remote => local,
        (Some(local), Some(remote)) => local.min(remote),
        _ => Checkpoint::default(),
    }
}

/// Loads the checkpoint to resume from.
///
/// With `ignore_saved` (after a reset) both copies are disregarded.
pub(crate) fn load(
    store: &CheckpointStore,
    session: &mut TransferSession,
    checkpoint_id: &str,
    ignore_saved: bool,
) -> ReplicatorResult<Checkpoint> {
    if ignore_saved {
        store.reset(checkpoint_id);
        info!(checkpoint_id, "checkpoint reset; starting from zero");
        return Ok(Checkpoint::default());
    }
    let local = store.load(checkpoint_id)?;
    let remote = session.get_checkpoint(checkpoint_id)?;
    let checkpoint = reconcile(local, remote);
    if local.is_some() && local != remote {
        info!(
            checkpoint_id,
            ?local,
            ?remote,
            "local and remote checkpoints differ"
        );
    }
    debug!(
        checkpoint_id,
        local = checkpoint.local,
        remote = checkpoint.remote,
        "checkpoint loaded"
    );
    Ok(checkpoint)
}

/// Saves a checkpoint locally and mirrors it to the peer.
pub(crate) fn save(
    store: &CheckpointStore,
    session: &mut TransferSession,
    checkpoint_id: &str,
    checkpoint: &Checkpoint,
) -> ReplicatorResult<()> {
    store.save(checkpoint_id, checkpoint)?;
    session.set_checkpoint(checkpoint_id, checkpoint)
}

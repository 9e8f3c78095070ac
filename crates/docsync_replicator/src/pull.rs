//! Pull pass: applies the peer's changes to the local database.

use crate::checkpoint;
use crate::config::ReplicatorConfiguration;
use crate::error::{is_document_error, ReplicatorError, ReplicatorResult};
use crate::replicator::Shared;
use crate::session::TransferSession;
use crate::status::{Direction, DocumentFlags, ReplicatedDocument};
use docsync_core::{decode_properties, Checkpoint, Document, InsertOutcome, Properties};
use docsync_protocol::{
    chunk_to_fit, classify, possible_ancestors, Change, Message, RevisionPayload,
    RevisionRequest, RevisionStatus, SubChanges,
};
use tracing::{debug, warn};

/// Pulls until the peer's feed is caught up or a stop is requested.
///
/// Returns true if any change was processed.
pub(crate) fn pull_pass(
    shared: &Shared,
    session: &mut TransferSession,
    checkpoint: &mut Checkpoint,
) -> ReplicatorResult<bool> {
    let config = shared.config();
    let store = config.database.checkpoints();
    let mut worked = false;

    while !shared.is_stopping() {
        let batch = session.changes(SubChanges {
            since: checkpoint.remote,
            limit: config.batch_size,
            channels: config.channels.clone(),
            doc_ids: config.document_ids.clone(),
        })?;

        if batch.changes.is_empty() {
            // Everything after the cursor was filtered out on the peer.
            if batch.last_sequence > checkpoint.remote {
                checkpoint.remote = batch.last_sequence;
                checkpoint::save(&store, session, shared.checkpoint_id(), checkpoint)?;
            }
            break;
        }

        worked = true;
        shared.mark_busy();
        let count = batch.changes.len() as u64;
        shared.add_discovered(count);

        let documents = apply_changes(config, session, &batch.changes)?;

        checkpoint.remote = batch.last_sequence;
        checkpoint::save(&store, session, shared.checkpoint_id(), checkpoint)?;
        shared.add_completed(count);
        shared.notify_documents(Direction::Pull, documents);

        if batch.caught_up {
            break;
        }
    }
    Ok(worked)
}

fn apply_changes(
    config: &ReplicatorConfiguration,
    session: &mut TransferSession,
    changes: &[Change],
) -> ReplicatorResult<Vec<ReplicatedDocument>> {
    let db = &config.database;
    let mut documents = Vec::new();
    let mut requests = Vec::new();

    for change in changes {
        if change.access_removed {
            documents.push(remove_access(config, change)?);
            continue;
        }
        if db.contains_revision(&change.doc_id, &change.revision_id) {
            continue;
        }
        let known = db.known_revisions(&change.doc_id);
        requests.push(RevisionRequest {
            doc_id: change.doc_id.clone(),
            revision_id: change.revision_id.clone(),
            known_ancestors: possible_ancestors(&known, &change.revision_id),
        });
    }

    if requests.is_empty() {
        return Ok(documents);
    }
    let windows = chunk_to_fit(requests, config.max_frame_len, |requests| {
        Message::GetRevs { requests }
    })?;
    for request in windows.oversized {
        documents.push(too_large(request.doc_id));
    }
    for window in windows.chunks {
        receive_window(config, session, window, &mut documents)?;
    }
    Ok(documents)
}

/// Fetches and stores one window of requested revisions. A peer that stops
/// early to respect the frame limit is asked again for the rest.
fn receive_window(
    config: &ReplicatorConfiguration,
    session: &mut TransferSession,
    mut pending: Vec<RevisionRequest>,
    documents: &mut Vec<ReplicatedDocument>,
) -> ReplicatorResult<()> {
    while !pending.is_empty() {
        let requested = pending.len();
        let received = session.receive_batch(pending.clone())?;

        // Requests up to the last one answered have been dealt with; the
        // peer skips revisions that were superseded meanwhile.
        let answered = pending
            .iter()
            .rposition(|request| {
                received.revisions.iter().any(|payload| {
                    payload.doc_id == request.doc_id
                        && payload.revision_id() == Some(&request.revision_id)
                }) || received.refused.iter().any(|refused| {
                    refused.doc_id == request.doc_id && refused.revision_id == request.revision_id
                })
            })
            .map_or(0, |index| index + 1);
        if received.revisions.len() + received.refused.len() < answered {
            debug!(
                requested,
                received = received.revisions.len(),
                "some revisions were superseded on the peer"
            );
        }

        for refused in received.refused {
            let error = refused.error.map_or_else(
                || ReplicatorError::Protocol("revision refused without a reason".into()),
                |error| ReplicatorError::from_document_error(&refused.doc_id, error),
            );
            debug!(doc_id = %refused.doc_id, %error, "peer refused to send revision");
            documents.push(ReplicatedDocument {
                id: refused.doc_id,
                flags: DocumentFlags::default(),
                error: Some(error),
            });
        }
        for payload in received.revisions {
            if let Some(document) = apply_revision(config, payload)? {
                documents.push(document);
            }
        }

        if !received.truncated {
            break;
        }
        if answered == 0 {
            return Err(ReplicatorError::Protocol(
                "peer truncated a revisions reply without answering any request".into(),
            ));
        }
        pending.drain(..answered);
    }
    Ok(())
}

fn too_large(doc_id: String) -> ReplicatedDocument {
    ReplicatedDocument {
        error: Some(ReplicatorError::DocumentTooLarge {
            doc_id: doc_id.clone(),
        }),
        id: doc_id,
        flags: DocumentFlags::default(),
    }
}

/// Stores one pulled revision. Returns `None` when there is nothing to report.
fn apply_revision(
    config: &ReplicatorConfiguration,
    payload: RevisionPayload,
) -> ReplicatorResult<Option<ReplicatedDocument>> {
    let db = &config.database;
    let mut flags = DocumentFlags {
        deleted: payload.deleted,
        ..DocumentFlags::default()
    };
    let report = |flags: DocumentFlags, error: Option<ReplicatorError>| ReplicatedDocument {
        id: payload.doc_id.clone(),
        flags,
        error,
    };

    let Some(revision_id) = payload.revision_id().cloned() else {
        return Ok(Some(report(
            flags,
            Some(ReplicatorError::Protocol("revision without history".into())),
        )));
    };

    let known = db.known_revisions(&payload.doc_id);
    let current = db.read_revision(&payload.doc_id)?.map(|rev| rev.revision_id);
    let status = classify(&known, current.as_ref(), &payload.history);
    if status == RevisionStatus::Known {
        return Ok(None);
    }

    if let Some(filter) = &config.pull_filter {
        let properties = match decode_properties(&payload.body) {
            Ok(properties) => properties,
            Err(_) if payload.deleted => Properties::new(),
            Err(err) => return Ok(Some(report(flags, Some(err.into())))),
        };
        let document = Document::from_parts(
            payload.doc_id.clone(),
            Some(revision_id.clone()),
            0,
            properties,
            payload.deleted,
        );
        if !filter(&document, flags) {
            debug!(doc_id = %payload.doc_id, revision = %revision_id, "pull filter rejected revision");
            return Ok(Some(report(
                flags,
                Some(ReplicatorError::FilterRejected {
                    doc_id: payload.doc_id.clone(),
                }),
            )));
        }
    }

    match db.insert_revision(&payload.to_insert(), true) {
        Ok(InsertOutcome::AlreadyKnown) => Ok(None),
        Ok(InsertOutcome::Inserted { conflicted, .. }) => {
            if conflicted {
                debug!(doc_id = %payload.doc_id, revision = %revision_id, ?status, "stored conflicting branch");
            }
            flags.conflicted = conflicted;
            Ok(Some(report(flags, None)))
        }
        Err(err) if is_document_error(&err) => {
            warn!(doc_id = %payload.doc_id, error = %err, "cannot store pulled revision");
            Ok(Some(report(flags, Some(err.into()))))
        }
        Err(err) => Err(err.into()),
    }
}

/// Handles a change the user can no longer see: the local copy is purged
/// unless the pull filter keeps it.
fn remove_access(
    config: &ReplicatorConfiguration,
    change: &Change,
) -> ReplicatorResult<ReplicatedDocument> {
    let db = &config.database;
    let flags = DocumentFlags {
        deleted: change.deleted,
        access_removed: true,
        conflicted: false,
    };
    let report = |error: Option<ReplicatorError>| ReplicatedDocument {
        id: change.doc_id.clone(),
        flags,
        error,
    };

    if let Some(filter) = &config.pull_filter {
        if let Some(document) = db.get_document(&change.doc_id)? {
            if !filter(&document, flags) {
                debug!(doc_id = %change.doc_id, "pull filter kept revoked document");
                return Ok(report(Some(ReplicatorError::FilterRejected {
                    doc_id: change.doc_id.clone(),
                })));
            }
        }
    }

    match db.purge_document(&change.doc_id) {
        Ok(purged) => {
            debug!(doc_id = %change.doc_id, purged, "access removed");
            Ok(report(None))
        }
        Err(err) if is_document_error(&err) => Ok(report(Some(err.into()))),
        Err(err) => Err(err.into()),
    }
}

//! Push pass: sends local changes the peer lacks.

use crate::checkpoint;
use crate::config::ReplicatorConfiguration;
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::replicator::Shared;
use crate::session::TransferSession;
use crate::status::{Direction, DocumentFlags, ReplicatedDocument};
use docsync_core::{ChangeEntry, Checkpoint, Database, Document, Properties};
use docsync_protocol::{chunk_to_fit, trim_history, Message, ProposedRevision, RevisionPayload};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Pushes local changes after the checkpoint until none are left or a stop
/// is requested.
///
/// Returns true if any change was processed.
pub(crate) fn push_pass(
    shared: &Shared,
    session: &mut TransferSession,
    checkpoint: &mut Checkpoint,
) -> ReplicatorResult<bool> {
    let config = shared.config();
    let store = config.database.checkpoints();
    let doc_ids: HashSet<&str> = config.document_ids.iter().map(String::as_str).collect();
    let mut worked = false;

    while !shared.is_stopping() {
        let entries = config
            .database
            .changes_since(checkpoint.local, config.batch_size as usize);
        let Some(last) = entries.last().map(|entry| entry.sequence) else {
            break;
        };

        worked = true;
        shared.mark_busy();
        let count = entries.len() as u64;
        shared.add_discovered(count);

        let documents = push_entries(config, session, &entries, &doc_ids)?;

        // Excluded documents are skipped for good: the cursor moves past them.
        checkpoint.local = last;
        checkpoint::save(&store, session, shared.checkpoint_id(), checkpoint)?;
        shared.add_completed(count);
        shared.notify_documents(Direction::Push, documents);
    }
    Ok(worked)
}

fn push_entries(
    config: &ReplicatorConfiguration,
    session: &mut TransferSession,
    entries: &[ChangeEntry],
    doc_ids: &HashSet<&str>,
) -> ReplicatorResult<Vec<ReplicatedDocument>> {
    let db = &config.database;
    let mut proposed = Vec::with_capacity(entries.len());

    for entry in entries {
        if !doc_ids.is_empty() && !doc_ids.contains(entry.doc_id.as_str()) {
            continue;
        }
        if let Some(filter) = &config.push_filter {
            let flags = DocumentFlags {
                deleted: entry.deleted,
                ..DocumentFlags::default()
            };
            let Some(document) = local_document(db, entry)? else {
                continue;
            };
            if !filter(&document, flags) {
                debug!(doc_id = %entry.doc_id, "push filter excluded document");
                continue;
            }
        }
        proposed.push(ProposedRevision {
            doc_id: entry.doc_id.clone(),
            revision_id: entry.revision_id.clone(),
        });
    }
    if proposed.is_empty() {
        return Ok(Vec::new());
    }

    let mut documents = Vec::new();
    let mut missing = Vec::new();
    let proposals = chunk_to_fit(proposed, config.max_frame_len, |proposed| {
        Message::RevsDiff { proposed }
    })?;
    for proposed in proposals.chunks {
        missing.extend(session.revs_diff(proposed)?);
    }
    for proposal in proposals.oversized {
        documents.push(too_large(proposal.doc_id, false));
    }

    let mut payloads = Vec::with_capacity(missing.len());
    let mut deleted = HashMap::new();
    for wanted in missing {
        let Some(revision) = db.read_revision_at(&wanted.doc_id, &wanted.revision_id)? else {
            debug!(doc_id = %wanted.doc_id, "revision gone before push");
            continue;
        };
        let history = trim_history(
            &db.revision_history(&wanted.doc_id, &wanted.revision_id),
            &wanted.possible_ancestors,
            config.max_history,
        );
        deleted.insert(wanted.doc_id.clone(), revision.deleted);
        payloads.push(RevisionPayload {
            doc_id: wanted.doc_id,
            history,
            deleted: revision.deleted,
            body: revision.body,
        });
    }

    // Each batch fits one frame; a revision that fits no frame is reported
    // for its document and the rest still go out.
    let batches = chunk_to_fit(payloads, config.max_frame_len, |revisions| {
        Message::PushRevs { revisions }
    })?;
    for payload in batches.oversized {
        debug!(doc_id = %payload.doc_id, "revision too large to push");
        documents.push(too_large(payload.doc_id, payload.deleted));
    }
    for revisions in batches.chunks {
        let results = session.send_batch(revisions)?;
        documents.extend(results.into_iter().map(|result| {
            let flags = DocumentFlags {
                deleted: deleted.get(&result.doc_id).copied().unwrap_or(false),
                ..DocumentFlags::default()
            };
            let error = result
                .error
                .map(|error| ReplicatorError::from_document_error(&result.doc_id, error));
            if let Some(error) = &error {
                debug!(doc_id = %result.doc_id, %error, "peer rejected revision");
            }
            ReplicatedDocument {
                id: result.doc_id,
                flags,
                error,
            }
        }));
    }
    Ok(documents)
}

fn too_large(doc_id: String, deleted: bool) -> ReplicatedDocument {
    ReplicatedDocument {
        error: Some(ReplicatorError::DocumentTooLarge {
            doc_id: doc_id.clone(),
        }),
        id: doc_id,
        flags: DocumentFlags {
            deleted,
            ..DocumentFlags::default()
        },
    }
}

/// Snapshot of the revision a change entry names, as shown to the push
/// filter.
fn local_document(db: &Database, entry: &ChangeEntry) -> ReplicatorResult<Option<Document>> {
    let Some(revision) = db.read_revision_at(&entry.doc_id, &entry.revision_id)? else {
        return Ok(None);
    };
    let properties = if revision.deleted {
        revision.properties().unwrap_or_else(|_| Properties::new())
    } else {
        revision.properties()?
    };
    Ok(Some(Document::from_parts(
        entry.doc_id.clone(),
        Some(entry.revision_id.clone()),
        entry.sequence,
        properties,
        revision.deleted,
    )))
}

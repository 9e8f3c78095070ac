//! Transactions.
//!
//! A [`Transaction`] is handed to the closure passed to
//! [`Database::in_batch`](crate::Database::in_batch). Its writes become
//! visible together when the closure returns `Ok`, and produce a single
//! change notification; on `Err` they are rolled back.

use crate::codec::encode_properties;
use crate::document::{ConcurrencyControl, Document, MutableDocument, Properties};
use crate::error::{CoreError, CoreResult};
use crate::notify::DocumentChange;
use crate::revision::{InsertOutcome, RevisionId, RevisionInsert};
use crate::store::{Store, Undo};

/// A group of writes committed atomically.
pub struct Transaction<'a> {
    store: &'a mut Store,
    undo: Undo,
    changes: Vec<DocumentChange>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(store: &'a mut Store) -> Self {
        let undo = store.begin();
        Self {
            store,
            undo,
            changes: Vec::new(),
        }
    }

    /// Reads a live document, seeing this transaction's own writes.
    pub fn get_document(&self, doc_id: &str) -> CoreResult<Option<Document>> {
        self.store.document(doc_id)
    }

    /// Saves a document, overwriting concurrent changes.
    ///
    /// `doc` itself is left untouched since the batch may still roll back;
    /// the returned snapshot carries the new revision.
    pub fn save_document(&mut self, doc: &MutableDocument) -> CoreResult<Document> {
        self.save_document_with(doc, ConcurrencyControl::LastWriteWins)
    }

    /// Saves a document with explicit concurrency control.
    pub fn save_document_with(
        &mut self,
        doc: &MutableDocument,
        control: ConcurrencyControl,
    ) -> CoreResult<Document> {
        let parent = self.resolve_parent(doc.id(), doc.revision_id(), control)?;
        let body = encode_properties(doc.properties())?;
        let (revision_id, sequence) = self.store.write_revision(
            &mut self.undo,
            doc.id(),
            parent.as_ref(),
            body,
            false,
        )?;
        self.record(doc.id(), Some(sequence));
        Ok(Document::from_parts(
            doc.id(),
            Some(revision_id),
            sequence,
            doc.properties().clone(),
            false,
        ))
    }

    /// Deletes a document, overwriting concurrent changes.
    pub fn delete_document(&mut self, doc: &Document) -> CoreResult<()> {
        self.delete_document_with(doc, ConcurrencyControl::LastWriteWins)
    }

    /// Deletes a document with explicit concurrency control.
    pub fn delete_document_with(
        &mut self,
        doc: &Document,
        control: ConcurrencyControl,
    ) -> CoreResult<()> {
        let parent = self.resolve_parent(doc.id(), doc.revision_id(), control)?;
        let (_, sequence) =
            self.store
                .write_revision(&mut self.undo, doc.id(), parent.as_ref(), Vec::new(), true)?;
        self.record(doc.id(), Some(sequence));
        Ok(())
    }

    /// Writes a revision on top of `parent`, which must be current.
    pub fn write_revision(
        &mut self,
        doc_id: &str,
        parent: Option<&RevisionId>,
        properties: &Properties,
        deleted: bool,
    ) -> CoreResult<RevisionId> {
        let body = if deleted {
            Vec::new()
        } else {
            encode_properties(properties)?
        };
        let (revision_id, sequence) =
            self.store
                .write_revision(&mut self.undo, doc_id, parent, body, deleted)?;
        self.record(doc_id, Some(sequence));
        Ok(revision_id)
    }

    /// Inserts a revision received from another database.
    ///
    /// With `allow_conflict` false a revision that would open a new branch
    /// next to a live current revision is refused.
    pub fn insert_revision(
        &mut self,
        insert: &RevisionInsert,
        allow_conflict: bool,
    ) -> CoreResult<InsertOutcome> {
        let outcome = self
            .store
            .insert_revision(&mut self.undo, insert, allow_conflict)?;
        if let InsertOutcome::Inserted { sequence, .. } = outcome {
            self.record(&insert.doc_id, Some(sequence));
        }
        Ok(outcome)
    }

    /// Removes every trace of a document. Returns false if it did not exist.
    pub fn purge_document(&mut self, doc_id: &str) -> CoreResult<bool> {
        let purged = self.store.purge(&mut self.undo, doc_id);
        if purged {
            self.record(doc_id, None);
        }
        Ok(purged)
    }

    fn resolve_parent(
        &self,
        doc_id: &str,
        base: Option<&RevisionId>,
        control: ConcurrencyControl,
    ) -> CoreResult<Option<RevisionId>> {
        let current = self.store.current_revision(doc_id);
        match control {
            ConcurrencyControl::LastWriteWins => Ok(current.map(|rev| rev.revision_id)),
            ConcurrencyControl::FailOnConflict => match (base, current) {
                (None, None) => Ok(None),
                (None, Some(current)) if current.deleted => Ok(Some(current.revision_id)),
                (Some(base), Some(current)) if *base == current.revision_id => {
                    Ok(Some(current.revision_id))
                }
                _ => Err(CoreError::conflict(doc_id)),
            },
        }
    }

    fn record(&mut self, doc_id: &str, sequence: Option<u64>) {
        match self
            .changes
            .iter_mut()
            .find(|change| change.doc_id == doc_id)
        {
            Some(change) => change.sequence = sequence,
            None => self.changes.push(DocumentChange {
                doc_id: doc_id.to_string(),
                sequence,
            }),
        }
    }

    pub(crate) fn commit(self) -> Vec<DocumentChange> {
        self.changes
    }

    pub(crate) fn rollback(self) {
        self.store.rollback(self.undo);
    }
}

//! The database handle.

use crate::checkpoint::CheckpointStore;
use crate::config::DatabaseConfig;
use crate::document::{ConcurrencyControl, Document, MutableDocument, Properties};
use crate::error::{CoreError, CoreResult};
use crate::listener::ListenerToken;
use crate::notify::{ChangeBatch, Notifier};
use crate::revision::{ChangeEntry, InsertOutcome, Revision, RevisionId, RevisionInsert};
use crate::store::Store;
use crate::transaction::Transaction;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

struct DatabaseInner {
    config: DatabaseConfig,
    uuid: Uuid,
    store: RwLock<Store>,
    notifier: Notifier,
    next_commit: AtomicU64,
    leased_checkpoints: Mutex<HashSet<String>>,
}

/// A shared handle to a document database.
///
/// Cloning is cheap; all clones refer to the same database, which lives as
/// long as any handle (or any replicator or endpoint holding one) does.
///
/// # Example
///
/// ```rust
/// use docsync_core::{Database, MutableDocument};
///
/// let db = Database::open_in_memory("travel").unwrap();
/// let mut doc = MutableDocument::new("foo");
/// doc.set("greeting", "Howdy!");
/// db.save_document(&mut doc).unwrap();
/// assert_eq!(doc.sequence(), 1);
/// assert_eq!(db.count(), 1);
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens an empty database.
    pub fn open(config: DatabaseConfig) -> CoreResult<Self> {
        if config.name.is_empty() {
            return Err(CoreError::InvalidConfig("database name is empty".into()));
        }
        if config.max_history == 0 {
            return Err(CoreError::InvalidConfig("max_history must be positive".into()));
        }
        let uuid = Uuid::new_v4();
        debug!(name = %config.name, %uuid, "database opened");
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                config,
                uuid,
                store: RwLock::new(Store::default()),
                notifier: Notifier::new(),
                next_commit: AtomicU64::new(1),
                leased_checkpoints: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Opens an empty database with default settings.
    pub fn open_in_memory(name: impl Into<String>) -> CoreResult<Self> {
        Self::open(DatabaseConfig::new(name))
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Unique identity of this database instance.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Configuration the database was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// True if both handles refer to the same database.
    pub fn same_database(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live (non-deleted) documents.
    pub fn count(&self) -> usize {
        self.inner.store.read().count()
    }

    /// Sequence of the most recent change.
    pub fn last_sequence(&self) -> u64 {
        self.inner.store.read().last_sequence()
    }

    /// Same as [`last_sequence`](Self::last_sequence).
    pub fn current_sequence(&self) -> u64 {
        self.last_sequence()
    }

    // ---- documents ----

    /// Reads a live document.
    pub fn get_document(&self, doc_id: &str) -> CoreResult<Option<Document>> {
        self.inner.store.read().document(doc_id)
    }

    /// Reads a live document for editing.
    pub fn get_mutable_document(&self, doc_id: &str) -> CoreResult<Option<MutableDocument>> {
        Ok(self.get_document(doc_id)?.map(|doc| doc.to_mutable()))
    }

    /// Saves a document, overwriting concurrent changes.
    pub fn save_document(&self, doc: &mut MutableDocument) -> CoreResult<Document> {
        self.save_document_with(doc, ConcurrencyControl::LastWriteWins)
    }

    /// Saves a document with explicit concurrency control.
    pub fn save_document_with(
        &self,
        doc: &mut MutableDocument,
        control: ConcurrencyControl,
    ) -> CoreResult<Document> {
        let saved = self.in_batch(|txn| txn.save_document_with(doc, control))?;
        if let Some(revision_id) = saved.revision_id() {
            doc.mark_saved(revision_id.clone(), saved.sequence());
        }
        Ok(saved)
    }

    /// Deletes a document.
    pub fn delete_document(&self, doc: &Document) -> CoreResult<()> {
        self.in_batch(|txn| txn.delete_document(doc))
    }

    /// Deletes a document with explicit concurrency control.
    pub fn delete_document_with(
        &self,
        doc: &Document,
        control: ConcurrencyControl,
    ) -> CoreResult<()> {
        self.in_batch(|txn| txn.delete_document_with(doc, control))
    }

    /// Removes a document and its history. Returns false if it did not exist.
    pub fn purge_document(&self, doc_id: &str) -> CoreResult<bool> {
        self.in_batch(|txn| txn.purge_document(doc_id))
    }

    /// Runs `f` as one transaction.
    ///
    /// The closure must not call back into this database (it holds the write
    /// lock); use the [`Transaction`] instead.
    pub fn in_batch<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.commit(false, f)
    }

    /// Runs `f` as one transaction whose changes came from another database.
    pub fn in_replicated_batch<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.commit(true, f)
    }

    fn commit<T>(
        &self,
        external: bool,
        f: impl FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let result = {
            let mut store = self.inner.store.write();
            let mut txn = Transaction::new(&mut store);
            match f(&mut txn) {
                Ok(value) => {
                    let changes = txn.commit();
                    if !changes.is_empty() {
                        let commit_id = self.inner.next_commit.fetch_add(1, Ordering::Relaxed);
                        debug!(commit_id, docs = changes.len(), external, "commit");
                        self.inner
                            .notifier
                            .enqueue(ChangeBatch::new(commit_id, external, changes));
                    }
                    Ok(value)
                }
                Err(err) => {
                    txn.rollback();
                    Err(err)
                }
            }
        };
        self.inner.notifier.flush(self);
        result
    }

    // ---- storage interface ----

    /// Current revision of a document, including deletion tombstones.
    pub fn read_revision(&self, doc_id: &str) -> CoreResult<Option<Revision>> {
        Ok(self.inner.store.read().current_revision(doc_id))
    }

    /// A specific revision, if its body is stored here.
    pub fn read_revision_at(
        &self,
        doc_id: &str,
        revision_id: &RevisionId,
    ) -> CoreResult<Option<Revision>> {
        Ok(self.inner.store.read().revision_at(doc_id, revision_id))
    }

    /// Writes a revision on top of `parent`; fails with
    /// [`CoreError::Conflict`] if `parent` is not current.
    pub fn write_revision(
        &self,
        doc_id: &str,
        parent: Option<&RevisionId>,
        properties: &Properties,
        deleted: bool,
    ) -> CoreResult<RevisionId> {
        self.in_batch(|txn| txn.write_revision(doc_id, parent, properties, deleted))
    }

    /// Inserts one foreign revision in its own transaction.
    pub fn insert_revision(
        &self,
        insert: &RevisionInsert,
        allow_conflict: bool,
    ) -> CoreResult<InsertOutcome> {
        self.in_replicated_batch(|txn| txn.insert_revision(insert, allow_conflict))
    }

    /// Latest change per document after `since`, in sequence order.
    pub fn changes_since(&self, since: u64, limit: usize) -> Vec<ChangeEntry> {
        self.inner.store.read().changes_since(since, limit)
    }

    /// True if the revision (or a history stub of it) is known.
    pub fn contains_revision(&self, doc_id: &str, revision_id: &RevisionId) -> bool {
        self.inner.store.read().contains_revision(doc_id, revision_id)
    }

    /// Known revisions of a document, newest first, up to the history depth.
    pub fn known_revisions(&self, doc_id: &str) -> Vec<RevisionId> {
        self.inner
            .store
            .read()
            .known_revisions(doc_id, self.inner.config.max_history)
    }

    /// Leaf revisions of a document, newest first.
    pub fn leaf_revisions(&self, doc_id: &str) -> Vec<RevisionId> {
        self.inner.store.read().leaf_revisions(doc_id)
    }

    /// Ancestry of a revision, newest first, up to the history depth.
    pub fn revision_history(&self, doc_id: &str, revision_id: &RevisionId) -> Vec<RevisionId> {
        self.inner
            .store
            .read()
            .history(doc_id, revision_id, self.inner.config.max_history)
    }

    /// True if the document has more than one live leaf.
    pub fn is_conflicted(&self, doc_id: &str) -> bool {
        self.inner.store.read().is_conflicted(doc_id)
    }

    // ---- local documents ----

    /// Reads a local (non-replicated) document.
    pub fn get_local(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.store.read().get_local(key)
    }

    /// Writes a local document. Local documents have no sequence and raise
    /// no notifications.
    pub fn put_local(&self, key: &str, value: Vec<u8>) {
        self.inner.store.write().put_local(key, value);
    }

    /// Deletes a local document.
    pub fn delete_local(&self, key: &str) -> bool {
        self.inner.store.write().delete_local(key)
    }

    /// Replication checkpoints kept in this database.
    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.clone())
    }

    pub(crate) fn try_lease_checkpoint(&self, checkpoint_id: &str) -> bool {
        self.inner
            .leased_checkpoints
            .lock()
            .insert(checkpoint_id.to_string())
    }

    pub(crate) fn release_checkpoint(&self, checkpoint_id: &str) {
        self.inner.leased_checkpoints.lock().remove(checkpoint_id);
    }

    // ---- notifications ----

    /// Registers a callback for every commit, receiving the changed IDs.
    pub fn add_listener<F>(&self, callback: F) -> ListenerToken
    where
        F: Fn(&Database, &[String]) + Send + Sync + 'static,
    {
        self.inner.notifier.add_listener(Box::new(callback))
    }

    /// Registers a callback for changes to one document.
    pub fn add_document_listener<F>(&self, doc_id: impl Into<String>, callback: F) -> ListenerToken
    where
        F: Fn(&Database, &str) + Send + Sync + 'static,
    {
        self.inner
            .notifier
            .add_document_listener(doc_id.into(), Box::new(callback))
    }

    /// Registers a callback that sees every commit as soon as it happens,
    /// even while notifications are buffered.
    pub fn observe_commits<F>(&self, callback: F) -> ListenerToken
    where
        F: Fn(&ChangeBatch) + Send + Sync + 'static,
    {
        self.inner.notifier.observe(Box::new(callback))
    }

    /// Switches to buffered delivery.
    ///
    /// Listeners stop firing on commit. `ready` is called when the first
    /// notification becomes pending after the last
    /// [`send_notifications`](Self::send_notifications); call that to
    /// deliver.
    pub fn buffer_notifications<F>(&self, ready: F)
    where
        F: Fn(&Database) + Send + Sync + 'static,
    {
        self.inner.notifier.buffer(Arc::new(ready));
    }

    /// True once [`buffer_notifications`](Self::buffer_notifications) was called.
    pub fn is_buffering_notifications(&self) -> bool {
        self.inner.notifier.is_buffered()
    }

    /// Delivers all buffered notifications, in commit order, on this thread.
    pub fn send_notifications(&self) {
        self.inner.notifier.send_pending(self);
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.config.name)
            .field("uuid", &self.inner.uuid)
            .finish()
    }
}

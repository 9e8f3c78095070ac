//! Change notification scheduling.
//!
//! Every commit that touches at least one document produces a
//! [`ChangeBatch`]. Batches are queued while the store's write lock is still
//! held, so the queue order is the commit order, and then drained by the
//! committing thread once the lock is released:
//!
//! - commit observers (replicators) see every batch immediately;
//! - database and document listeners see it immediately in the default mode,
//!   or once [`Database::send_notifications`] is called in buffered mode.
//!
//! Only one thread drains at a time. A thread that commits while another one
//! is delivering waits for it, and by then its own batch has been delivered
//! as well.

use crate::database::Database;
use crate::listener::{ListenerRegistry, ListenerToken};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Callback for database-wide changes: receives the IDs changed by one commit.
pub type ChangeCallback = dyn Fn(&Database, &[String]) + Send + Sync;

/// Callback for a single document's changes.
pub type DocumentChangeCallback = dyn Fn(&Database, &str) + Send + Sync;

/// Callback invoked for every commit, bypassing buffering.
pub type CommitObserver = dyn Fn(&ChangeBatch) + Send + Sync;

/// Callback telling the owner that buffered notifications are pending.
pub type ReadyCallback = dyn Fn(&Database) + Send + Sync;

/// One document touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Changed document.
    pub doc_id: String,
    /// Sequence assigned by the commit; `None` for purges.
    pub sequence: Option<u64>,
}

/// Everything one transaction changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    commit_id: u64,
    external: bool,
    changes: Vec<DocumentChange>,
    doc_ids: Vec<String>,
}

impl ChangeBatch {
    pub(crate) fn new(commit_id: u64, external: bool, changes: Vec<DocumentChange>) -> Self {
        let doc_ids = changes.iter().map(|change| change.doc_id.clone()).collect();
        Self {
            commit_id,
            external,
            changes,
            doc_ids,
        }
    }

    /// Identity of the committing transaction.
    pub fn commit_id(&self) -> u64 {
        self.commit_id
    }

    /// True if the changes were applied by replication rather than locally.
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Changed documents with their sequences.
    pub fn changes(&self) -> &[DocumentChange] {
        &self.changes
    }

    /// Changed document IDs, each listed once.
    pub fn doc_ids(&self) -> &[String] {
        &self.doc_ids
    }

    /// Highest sequence assigned by the commit.
    pub fn max_sequence(&self) -> Option<u64> {
        self.changes.iter().filter_map(|change| change.sequence).max()
    }
}

#[derive(Default)]
struct Queues {
    /// Committed but not yet drained, with the mode in force at commit time.
    incoming: VecDeque<(ChangeBatch, bool)>,
    /// Drained in buffered mode, waiting for `send_notifications`.
    pending: VecDeque<ChangeBatch>,
    ready: Option<Arc<ReadyCallback>>,
}

pub(crate) struct Notifier {
    database_listeners: Arc<ListenerRegistry<ChangeCallback>>,
    document_listeners: Arc<ListenerRegistry<DocumentChangeCallback>>,
    observers: Arc<ListenerRegistry<CommitObserver>>,
    queues: Mutex<Queues>,
    /// Held while draining; the flag marks a drain in progress on this thread.
    delivery: ReentrantMutex<Cell<bool>>,
}

/// Clears the draining flag even if a callback panics.
struct Draining<'a>(&'a Cell<bool>);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            database_listeners: ListenerRegistry::new(),
            document_listeners: ListenerRegistry::new(),
            observers: ListenerRegistry::new(),
            queues: Mutex::new(Queues::default()),
            delivery: ReentrantMutex::new(Cell::new(false)),
        }
    }

    pub(crate) fn add_listener(&self, callback: Box<ChangeCallback>) -> ListenerToken {
        self.database_listeners.add(None, callback)
    }

    pub(crate) fn add_document_listener(
        &self,
        doc_id: String,
        callback: Box<DocumentChangeCallback>,
    ) -> ListenerToken {
        self.document_listeners.add(Some(doc_id), callback)
    }

    pub(crate) fn observe(&self, callback: Box<CommitObserver>) -> ListenerToken {
        self.observers.add(None, callback)
    }

    pub(crate) fn buffer(&self, ready: Arc<ReadyCallback>) {
        self.queues.lock().ready = Some(ready);
    }

    pub(crate) fn is_buffered(&self) -> bool {
        self.queues.lock().ready.is_some()
    }

    /// Queues a committed batch. Called with the store write lock held.
    pub(crate) fn enqueue(&self, batch: ChangeBatch) {
        let mut queues = self.queues.lock();
        let buffered = queues.ready.is_some();
        queues.incoming.push_back((batch, buffered));
    }

    /// Delivers everything queued by `enqueue`.
    pub(crate) fn flush(&self, db: &Database) {
        let draining = self.delivery.lock();
        if draining.get() {
            // A callback committed; the outer drain loop picks the batch up.
            return;
        }
        draining.set(true);
        let _reset = Draining(&draining);

        loop {
            let Some((batch, buffered)) = self.queues.lock().incoming.pop_front() else {
                break;
            };
            for observer in self.observers.snapshot() {
                observer.invoke(|callback| callback(&batch));
            }
            if buffered {
                let ready = {
                    let mut queues = self.queues.lock();
                    let was_empty = queues.pending.is_empty();
                    queues.pending.push_back(batch);
                    if was_empty {
                        queues.ready.clone()
                    } else {
                        None
                    }
                };
                if let Some(ready) = ready {
                    ready(db);
                }
            } else {
                self.deliver(db, &batch);
            }
        }
    }

    /// Delivers all buffered batches in commit order.
    pub(crate) fn send_pending(&self, db: &Database) {
        let _delivery = self.delivery.lock();
        let pending: Vec<ChangeBatch> = self.queues.lock().pending.drain(..).collect();
        if !pending.is_empty() {
            debug!(batches = pending.len(), "sending buffered notifications");
        }
        for batch in &pending {
            self.deliver(db, batch);
        }
    }

    fn deliver(&self, db: &Database, batch: &ChangeBatch) {
        let doc_ids = batch.doc_ids();
        for listener in self.database_listeners.snapshot() {
            listener.invoke(|callback| callback(db, doc_ids));
        }
        if self.document_listeners.is_empty() {
            return;
        }
        for doc_id in doc_ids {
            for listener in self.document_listeners.snapshot_scoped(doc_id) {
                listener.invoke(|callback| callback(db, doc_id));
            }
        }
    }
}

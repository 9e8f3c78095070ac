//! Helpers shared by the replicator integration tests.

#![allow(dead_code)]

use docsync_core::{Database, MutableDocument, RevisionId};
use docsync_replicator::{
    ActivityLevel, DocumentReplication, ReplicatedDocument, Replicator, ReplicatorStatus,
};
use serde_json::{json, Value};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Everything listeners saw during one run.
pub struct Run {
    pub statuses: Vec<ReplicatorStatus>,
    pub documents: Vec<DocumentReplication>,
}

impl Run {
    pub fn last(&self) -> &ReplicatorStatus {
        self.statuses.last().expect("no status delivered")
    }

    pub fn stopped_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| s.activity == ActivityLevel::Stopped)
            .count()
    }

    pub fn saw(&self, activity: ActivityLevel) -> bool {
        self.statuses.iter().any(|s| s.activity == activity)
    }

    /// Every document reported in one direction.
    pub fn reported(&self, push: bool) -> Vec<&ReplicatedDocument> {
        self.documents
            .iter()
            .filter(|batch| batch.is_push() == push)
            .flat_map(|batch| batch.documents.iter())
            .collect()
    }

    /// Document IDs reported in one direction, without errors.
    pub fn replicated_ids(&self, push: bool) -> Vec<String> {
        let mut ids: Vec<String> = self
            .documents
            .iter()
            .filter(|batch| batch.is_push() == push)
            .flat_map(|batch| batch.documents.iter())
            .filter(|doc| doc.error.is_none())
            .map(|doc| doc.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Listens to a replicator until it is dropped.
pub struct Recorder {
    statuses: Receiver<ReplicatorStatus>,
    documents: Arc<Mutex<Vec<DocumentReplication>>>,
    _tokens: Vec<docsync_core::ListenerToken>,
}

impl Recorder {
    pub fn attach(replicator: &Replicator) -> Self {
        let (tx, rx) = mpsc::channel();
        let documents = Arc::new(Mutex::new(Vec::new()));
        let status_token = replicator.add_change_listener(move |status| {
            let _ = tx.send(status.clone());
        });
        let sink = Arc::clone(&documents);
        let document_token = replicator.add_document_listener(move |batch| {
            sink.lock().unwrap().push(batch.clone());
        });
        Self {
            statuses: rx,
            documents,
            _tokens: vec![status_token, document_token],
        }
    }

    /// Collects statuses until `activity` is reported.
    pub fn until(&self, activity: ActivityLevel) -> Run {
        let mut statuses = Vec::new();
        loop {
            let status = self
                .statuses
                .recv_timeout(TIMEOUT)
                .unwrap_or_else(|_| panic!("timed out waiting for {activity:?}"));
            let done = status.activity == activity;
            statuses.push(status);
            if done {
                break;
            }
        }
        let documents = std::mem::take(&mut *self.documents.lock().unwrap());
        Run {
            statuses,
            documents,
        }
    }

    /// Statuses that arrive within `wait`.
    pub fn drain(&self, wait: Duration) -> Vec<ReplicatorStatus> {
        let mut statuses = Vec::new();
        while let Ok(status) = self.statuses.recv_timeout(wait) {
            statuses.push(status);
        }
        statuses
    }
}

/// Starts a one-shot replicator and waits for it to stop.
pub fn run_once(replicator: &Replicator) -> Run {
    let recorder = Recorder::attach(replicator);
    replicator.start();
    recorder.until(ActivityLevel::Stopped)
}

pub fn open(name: &str) -> Database {
    Database::open_in_memory(name).unwrap()
}

/// Saves `properties` (a JSON object) as document `id`.
pub fn save(db: &Database, id: &str, properties: Value) -> RevisionId {
    let mut doc = match db.get_mutable_document(id).unwrap() {
        Some(doc) => doc,
        None => MutableDocument::new(id),
    };
    let Value::Object(map) = properties else {
        panic!("properties must be an object");
    };
    *doc.properties_mut() = map;
    db.save_document(&mut doc)
        .unwrap()
        .revision_id()
        .unwrap()
        .clone()
}

pub fn named(name: &str) -> Value {
    json!({ "name": name })
}

pub fn current_revision(db: &Database, id: &str) -> Option<RevisionId> {
    db.read_revision(id).unwrap().map(|rev| rev.revision_id)
}

/// Polls `condition` until it holds or the timeout expires.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

//! In-memory revision store.
//!
//! Keeps every document's revision tree, a by-sequence index of the latest
//! change per document, and the non-replicated local documents. All mutation
//! goes through a [`Transaction`](crate::Transaction) holding the write lock,
//! which records enough in an [`Undo`] to roll back.

use crate::codec::decode_properties;
use crate::document::{validate_doc_id, Document};
use crate::error::{CoreError, CoreResult};
use crate::revision::{ChangeEntry, InsertOutcome, Revision, RevisionId, RevisionInsert};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

#[derive(Debug, Clone)]
struct RevNode {
    parent: Option<RevisionId>,
    deleted: bool,
    /// `None` for ancestors only known through a peer's history.
    body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub(crate) struct DocEntry {
    revs: HashMap<RevisionId, RevNode>,
    current: RevisionId,
    sequence: u64,
}

impl DocEntry {
    fn new(revision_id: RevisionId, node: RevNode) -> Self {
        let mut revs = HashMap::new();
        revs.insert(revision_id.clone(), node);
        Self {
            revs,
            current: revision_id,
            sequence: 0,
        }
    }

    fn leaves(&self) -> Vec<&RevisionId> {
        let parents: HashSet<&RevisionId> = self
            .revs
            .values()
            .filter_map(|node| node.parent.as_ref())
            .collect();
        self.revs.keys().filter(|rev| !parents.contains(rev)).collect()
    }

    fn is_leaf(&self, revision_id: &RevisionId) -> bool {
        self.revs.contains_key(revision_id)
            && !self
                .revs
                .values()
                .any(|node| node.parent.as_ref() == Some(revision_id))
    }

    fn recompute_current(&mut self) {
        if let Some(winner) = self.leaves().into_iter().max().cloned() {
            self.current = winner;
        }
    }

    fn current_deleted(&self) -> bool {
        self.revs.get(&self.current).is_some_and(|node| node.deleted)
    }

    fn is_conflicted(&self) -> bool {
        self.leaves()
            .into_iter()
            .filter(|rev| self.revs.get(*rev).is_some_and(|node| !node.deleted))
            .count()
            > 1
    }

    /// Ancestry of `revision_id`, newest first, at most `limit` entries.
    fn history(&self, revision_id: &RevisionId, limit: usize) -> Vec<RevisionId> {
        let mut out = Vec::new();
        let mut cursor = self.revs.get_key_value(revision_id);
        while let Some((rev, node)) = cursor {
            if out.len() >= limit {
                break;
            }
            out.push(rev.clone());
            cursor = node
                .parent
                .as_ref()
                .and_then(|parent| self.revs.get_key_value(parent));
        }
        out
    }

    fn revision(&self, doc_id: &str, revision_id: &RevisionId) -> Option<Revision> {
        let node = self.revs.get(revision_id)?;
        let body = node.body.clone()?;
        Some(Revision {
            doc_id: doc_id.to_string(),
            revision_id: revision_id.clone(),
            parent: node.parent.clone(),
            sequence: self.sequence,
            deleted: node.deleted,
            body,
        })
    }
}

/// State captured at transaction start for rollback.
#[derive(Debug)]
pub(crate) struct Undo {
    docs: HashMap<String, Option<DocEntry>>,
    last_sequence: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    docs: HashMap<String, DocEntry>,
    by_sequence: BTreeMap<u64, String>,
    last_sequence: u64,
    local_docs: HashMap<String, Vec<u8>>,
}

impl Store {
    pub(crate) fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub(crate) fn count(&self) -> usize {
        self.docs
            .values()
            .filter(|entry| !entry.current_deleted())
            .count()
    }

    pub(crate) fn begin(&self) -> Undo {
        Undo {
            docs: HashMap::new(),
            last_sequence: self.last_sequence,
        }
    }

    pub(crate) fn rollback(&mut self, undo: Undo) {
        for (doc_id, previous) in undo.docs {
            if let Some(entry) = self.docs.remove(&doc_id) {
                self.by_sequence.remove(&entry.sequence);
            }
            if let Some(entry) = previous {
                self.by_sequence.insert(entry.sequence, doc_id.clone());
                self.docs.insert(doc_id, entry);
            }
        }
        self.last_sequence = undo.last_sequence;
    }

    fn remember(&self, undo: &mut Undo, doc_id: &str) {
        undo.docs
            .entry(doc_id.to_string())
            .or_insert_with(|| self.docs.get(doc_id).cloned());
    }

    fn assign_sequence(&mut self, doc_id: &str) -> u64 {
        self.last_sequence += 1;
        let sequence = self.last_sequence;
        if let Some(entry) = self.docs.get_mut(doc_id) {
            let old = std::mem::replace(&mut entry.sequence, sequence);
            self.by_sequence.remove(&old);
        }
        self.by_sequence.insert(sequence, doc_id.to_string());
        sequence
    }

    /// Current (winning) revision, including deletion tombstones.
    pub(crate) fn current_revision(&self, doc_id: &str) -> Option<Revision> {
        let entry = self.docs.get(doc_id)?;
        entry.revision(doc_id, &entry.current)
    }

    pub(crate) fn revision_at(&self, doc_id: &str, revision_id: &RevisionId) -> Option<Revision> {
        self.docs.get(doc_id)?.revision(doc_id, revision_id)
    }

    /// Snapshot of a live document; deleted documents read as absent.
    pub(crate) fn document(&self, doc_id: &str) -> CoreResult<Option<Document>> {
        let Some(revision) = self.current_revision(doc_id) else {
            return Ok(None);
        };
        if revision.deleted {
            return Ok(None);
        }
        let properties = decode_properties(&revision.body)?;
        Ok(Some(Document::from_parts(
            doc_id,
            Some(revision.revision_id),
            revision.sequence,
            properties,
            false,
        )))
    }

    pub(crate) fn contains_revision(&self, doc_id: &str, revision_id: &RevisionId) -> bool {
        self.docs
            .get(doc_id)
            .is_some_and(|entry| entry.revs.contains_key(revision_id))
    }

    /// All known revisions of a document, newest first.
    pub(crate) fn known_revisions(&self, doc_id: &str, limit: usize) -> Vec<RevisionId> {
        let Some(entry) = self.docs.get(doc_id) else {
            return Vec::new();
        };
        let mut revs: Vec<RevisionId> = entry.revs.keys().cloned().collect();
        revs.sort_unstable_by(|a, b| b.cmp(a));
        revs.truncate(limit);
        revs
    }

    pub(crate) fn leaf_revisions(&self, doc_id: &str) -> Vec<RevisionId> {
        let Some(entry) = self.docs.get(doc_id) else {
            return Vec::new();
        };
        let mut leaves: Vec<RevisionId> = entry.leaves().into_iter().cloned().collect();
        leaves.sort_unstable_by(|a, b| b.cmp(a));
        leaves
    }

    pub(crate) fn history(
        &self,
        doc_id: &str,
        revision_id: &RevisionId,
        limit: usize,
    ) -> Vec<RevisionId> {
        self.docs
            .get(doc_id)
            .map(|entry| entry.history(revision_id, limit))
            .unwrap_or_default()
    }

    pub(crate) fn is_conflicted(&self, doc_id: &str) -> bool {
        self.docs.get(doc_id).is_some_and(DocEntry::is_conflicted)
    }

    pub(crate) fn changes_since(&self, since: u64, limit: usize) -> Vec<ChangeEntry> {
        self.by_sequence
            .range((Bound::Excluded(since), Bound::Unbounded))
            .take(limit)
            .filter_map(|(sequence, doc_id)| {
                let entry = self.docs.get(doc_id)?;
                Some(ChangeEntry {
                    sequence: *sequence,
                    doc_id: doc_id.clone(),
                    revision_id: entry.current.clone(),
                    deleted: entry.current_deleted(),
                })
            })
            .collect()
    }

    /// Writes a new revision on top of `parent`, which must be the current
    /// revision. A missing parent is accepted for new documents and for
    /// documents whose current revision is a deletion.
    pub(crate) fn write_revision(
        &mut self,
        undo: &mut Undo,
        doc_id: &str,
        parent: Option<&RevisionId>,
        body: Vec<u8>,
        deleted: bool,
    ) -> CoreResult<(RevisionId, u64)> {
        validate_doc_id(doc_id)?;
        let parent = match self.docs.get(doc_id) {
            None if deleted => return Err(CoreError::not_found(doc_id)),
            None if parent.is_some() => return Err(CoreError::conflict(doc_id)),
            None => None,
            Some(entry) => {
                let resolved = match parent {
                    Some(parent) => parent.clone(),
                    None if entry.current_deleted() => entry.current.clone(),
                    None => return Err(CoreError::conflict(doc_id)),
                };
                if resolved != entry.current {
                    return Err(CoreError::conflict(doc_id));
                }
                if deleted && entry.current_deleted() {
                    return Err(CoreError::not_found(doc_id));
                }
                Some(resolved)
            }
        };

        let revision_id = RevisionId::derive(parent.as_ref(), deleted, &body)?;
        self.remember(undo, doc_id);
        let node = RevNode {
            parent,
            deleted,
            body: Some(body),
        };
        match self.docs.get_mut(doc_id) {
            Some(entry) => {
                entry.revs.insert(revision_id.clone(), node);
                entry.recompute_current();
            }
            None => {
                self.docs
                    .insert(doc_id.to_string(), DocEntry::new(revision_id.clone(), node));
            }
        }
        let sequence = self.assign_sequence(doc_id);
        Ok((revision_id, sequence))
    }

    /// Inserts a revision received from another database along with the
    /// part of its history this store does not have yet.
    pub(crate) fn insert_revision(
        &mut self,
        undo: &mut Undo,
        insert: &RevisionInsert,
        allow_conflict: bool,
    ) -> CoreResult<InsertOutcome> {
        validate_doc_id(&insert.doc_id)?;
        let Some(revision_id) = insert.revision_id() else {
            return Err(CoreError::InvalidRevision("empty revision history".into()));
        };
        for pair in insert.history.windows(2) {
            if pair[1].generation().checked_add(1) != Some(pair[0].generation()) {
                return Err(CoreError::InvalidRevision(format!(
                    "history of {} skips from {} to {}",
                    insert.doc_id, pair[0], pair[1]
                )));
            }
        }

        // Number of history entries that are new to this store.
        let (fresh, conflicted) = match self.docs.get(&insert.doc_id) {
            None => (insert.history.len(), false),
            Some(entry) => {
                if entry.revs.contains_key(revision_id) {
                    return Ok(InsertOutcome::AlreadyKnown);
                }
                let common = insert
                    .history
                    .iter()
                    .position(|rev| entry.revs.contains_key(rev));
                let extends_current = common.is_some_and(|i| insert.history[i] == entry.current);
                let extends_leaf = common.is_some_and(|i| entry.is_leaf(&insert.history[i]));
                let conflicted = !extends_current && !entry.current_deleted();
                if conflicted && !allow_conflict && !(extends_leaf && entry.is_conflicted()) {
                    return Err(CoreError::conflict(&insert.doc_id));
                }
                (common.unwrap_or(insert.history.len()), conflicted)
            }
        };

        self.remember(undo, &insert.doc_id);
        let mut nodes = Vec::with_capacity(fresh);
        for index in (0..fresh).rev() {
            let newest = index == 0;
            nodes.push((
                insert.history[index].clone(),
                RevNode {
                    parent: insert.history.get(index + 1).cloned(),
                    deleted: newest && insert.deleted,
                    body: newest.then(|| insert.body.clone()),
                },
            ));
        }
        match self.docs.get_mut(&insert.doc_id) {
            Some(entry) => {
                entry.revs.extend(nodes);
                entry.recompute_current();
            }
            None => {
                let mut nodes = nodes.into_iter();
                if let Some((first_id, first_node)) = nodes.next() {
                    let mut entry = DocEntry::new(first_id, first_node);
                    entry.revs.extend(nodes);
                    entry.recompute_current();
                    self.docs.insert(insert.doc_id.clone(), entry);
                }
            }
        }
        let sequence = self.assign_sequence(&insert.doc_id);
        Ok(InsertOutcome::Inserted {
            sequence,
            conflicted,
        })
    }

    pub(crate) fn purge(&mut self, undo: &mut Undo, doc_id: &str) -> bool {
        if !self.docs.contains_key(doc_id) {
            return false;
        }
        self.remember(undo, doc_id);
        if let Some(entry) = self.docs.remove(doc_id) {
            self.by_sequence.remove(&entry.sequence);
        }
        true
    }

    pub(crate) fn get_local(&self, key: &str) -> Option<Vec<u8>> {
        self.local_docs.get(key).cloned()
    }

    pub(crate) fn put_local(&mut self, key: &str, value: Vec<u8>) {
        self.local_docs.insert(key.to_string(), value);
    }

    pub(crate) fn delete_local(&mut self, key: &str) -> bool {
        self.local_docs.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(store: &mut Store, doc_id: &str, parent: Option<&RevisionId>, body: &[u8]) -> RevisionId {
        let mut undo = store.begin();
        store
            .write_revision(&mut undo, doc_id, parent, body.to_vec(), false)
            .unwrap()
            .0
    }

    #[test]
    fn sequences_increase_per_write() {
        let mut store = Store::default();
        let r1 = write(&mut store, "a", None, b"1");
        write(&mut store, "b", None, b"1");
        write(&mut store, "a", Some(&r1), b"2");
        assert_eq!(store.last_sequence(), 3);

        let changes = store.changes_since(0, 10);
        let ids: Vec<_> = changes.iter().map(|c| c.doc_id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(changes[1].sequence, 3);
        assert!(store.changes_since(3, 10).is_empty());
    }

    #[test]
    fn stale_parent_conflicts() {
        let mut store = Store::default();
        let r1 = write(&mut store, "a", None, b"1");
        write(&mut store, "a", Some(&r1), b"2");

        let mut undo = store.begin();
        let err = store
            .write_revision(&mut undo, "a", Some(&r1), b"3".to_vec(), false)
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn rollback_restores_everything() {
        let mut store = Store::default();
        let r1 = write(&mut store, "a", None, b"1");

        let mut undo = store.begin();
        store
            .write_revision(&mut undo, "a", Some(&r1), b"2".to_vec(), false)
            .unwrap();
        store
            .write_revision(&mut undo, "b", None, b"1".to_vec(), false)
            .unwrap();
        store.rollback(undo);

        assert_eq!(store.last_sequence(), 1);
        assert_eq!(store.current_revision("a").unwrap().revision_id, r1);
        assert!(store.current_revision("b").is_none());
        assert_eq!(store.changes_since(0, 10).len(), 1);
    }

    #[test]
    fn insert_with_history_adds_stub_ancestors() {
        let mut store = Store::default();
        let r1 = RevisionId::derive(None, false, b"1").unwrap();
        let r2 = RevisionId::derive(Some(&r1), false, b"2").unwrap();
        let r3 = RevisionId::derive(Some(&r2), false, b"3").unwrap();
        let insert = RevisionInsert {
            doc_id: "a".into(),
            history: vec![r3.clone(), r2.clone(), r1.clone()],
            deleted: false,
            body: b"3".to_vec(),
        };
        let mut undo = store.begin();
        let outcome = store.insert_revision(&mut undo, &insert, false).unwrap();
        assert_eq!(
            outcome,
            InsertOutcome::Inserted {
                sequence: 1,
                conflicted: false
            }
        );
        assert_eq!(store.history("a", &r3, 10), vec![r3.clone(), r2.clone(), r1]);
        assert!(store.revision_at("a", &r2).is_none());
        assert!(store.contains_revision("a", &r2));

        let mut undo = store.begin();
        assert_eq!(
            store.insert_revision(&mut undo, &insert, false).unwrap(),
            InsertOutcome::AlreadyKnown
        );
    }

    #[test]
    fn diverging_insert_is_a_conflict_unless_allowed() {
        let mut store = Store::default();
        let base = write(&mut store, "a", None, b"base");
        let local = write(&mut store, "a", Some(&base), b"local");

        let remote = RevisionId::derive(Some(&base), false, b"remote").unwrap();
        let insert = RevisionInsert {
            doc_id: "a".into(),
            history: vec![remote.clone(), base.clone()],
            deleted: false,
            body: b"remote".to_vec(),
        };

        let mut undo = store.begin();
        assert!(store
            .insert_revision(&mut undo, &insert, false)
            .unwrap_err()
            .is_conflict());

        let outcome = store.insert_revision(&mut undo, &insert, true).unwrap();
        assert!(matches!(
            outcome,
            InsertOutcome::Inserted {
                conflicted: true,
                ..
            }
        ));
        assert!(store.is_conflicted("a"));
        let winner = local.clone().max(remote.clone());
        assert_eq!(store.current_revision("a").unwrap().revision_id, winner);
        assert_eq!(store.leaf_revisions("a").len(), 2);
    }

    #[test]
    fn multi_generation_fast_forward_is_not_a_conflict() {
        let mut store = Store::default();
        let r1 = write(&mut store, "a", None, b"1");
        let r2 = RevisionId::derive(Some(&r1), false, b"2").unwrap();
        let r3 = RevisionId::derive(Some(&r2), false, b"3").unwrap();
        let r4 = RevisionId::derive(Some(&r3), false, b"4").unwrap();
        let insert = RevisionInsert {
            doc_id: "a".into(),
            history: vec![r4.clone(), r3, r2, r1],
            deleted: false,
            body: b"4".to_vec(),
        };

        let mut undo = store.begin();
        let outcome = store.insert_revision(&mut undo, &insert, false).unwrap();
        assert_eq!(
            outcome,
            InsertOutcome::Inserted {
                sequence: 2,
                conflicted: false
            }
        );
        assert!(!store.is_conflicted("a"));
        assert_eq!(store.current_revision("a").unwrap().revision_id, r4);
        assert_eq!(store.leaf_revisions("a").len(), 1);
    }

    #[test]
    fn fast_forward_of_a_conflicting_leaf_is_accepted() {
        let mut store = Store::default();
        let base = write(&mut store, "a", None, b"base");
        write(&mut store, "a", Some(&base), b"local");
        let branch = RevisionId::derive(Some(&base), false, b"branch").unwrap();
        let mut undo = store.begin();
        store
            .insert_revision(
                &mut undo,
                &RevisionInsert {
                    doc_id: "a".into(),
                    history: vec![branch.clone(), base.clone()],
                    deleted: false,
                    body: b"branch".to_vec(),
                },
                true,
            )
            .unwrap();

        let next = RevisionId::derive(Some(&branch), false, b"next").unwrap();
        let last = RevisionId::derive(Some(&next), false, b"last").unwrap();
        let insert = RevisionInsert {
            doc_id: "a".into(),
            history: vec![last, next, branch, base],
            deleted: false,
            body: b"last".to_vec(),
        };
        let mut undo = store.begin();
        assert!(store.insert_revision(&mut undo, &insert, false).is_ok());
        assert_eq!(store.leaf_revisions("a").len(), 2);
    }

    #[test]
    fn maximal_generations_are_rejected_without_overflow() {
        let mut store = Store::default();
        let top = format!("{}-aa", u64::MAX);
        let insert = RevisionInsert {
            doc_id: "a".into(),
            history: vec!["1-bb".parse().unwrap(), top.parse().unwrap()],
            deleted: false,
            body: Vec::new(),
        };
        let mut undo = store.begin();
        assert!(matches!(
            store.insert_revision(&mut undo, &insert, true),
            Err(CoreError::InvalidRevision(_))
        ));

        let insert = RevisionInsert {
            doc_id: "a".into(),
            history: vec![top.parse().unwrap()],
            deleted: false,
            body: Vec::new(),
        };
        store.insert_revision(&mut undo, &insert, true).unwrap();
        let current = store.current_revision("a").unwrap().revision_id;
        assert!(matches!(
            store.write_revision(&mut undo, "a", Some(&current), b"x".to_vec(), false),
            Err(CoreError::InvalidRevision(_))
        ));
    }

    #[test]
    fn history_gaps_are_rejected() {
        let mut store = Store::default();
        let insert = RevisionInsert {
            doc_id: "a".into(),
            history: vec!["3-aa".parse().unwrap(), "1-bb".parse().unwrap()],
            deleted: false,
            body: Vec::new(),
        };
        let mut undo = store.begin();
        assert!(matches!(
            store.insert_revision(&mut undo, &insert, true),
            Err(CoreError::InvalidRevision(_))
        ));
    }

    #[test]
    fn delete_then_recreate() {
        let mut store = Store::default();
        let r1 = write(&mut store, "a", None, b"1");
        let mut undo = store.begin();
        store
            .write_revision(&mut undo, "a", Some(&r1), Vec::new(), true)
            .unwrap();
        assert_eq!(store.count(), 0);
        assert!(store.document("a").unwrap().is_none());

        let r3 = write(&mut store, "a", None, b"again");
        assert_eq!(r3.generation(), 3);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn local_docs_are_not_in_the_change_log() {
        let mut store = Store::default();
        store.put_local("checkpoint/x", vec![1, 2, 3]);
        assert_eq!(store.get_local("checkpoint/x"), Some(vec![1, 2, 3]));
        assert_eq!(store.last_sequence(), 0);
        assert!(store.delete_local("checkpoint/x"));
        assert!(!store.delete_local("checkpoint/x"));
    }
}

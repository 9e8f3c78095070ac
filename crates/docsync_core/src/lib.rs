//! # docsync core
//!
//! The local side of docsync: an in-memory document database with revision
//! trees, checkpoints for replication, and change notifications.
//!
//! This crate provides:
//! - [`Database`]: shared handle with documents, transactions and the
//!   storage interface replication works through
//! - [`RevisionId`] and revision trees with a deterministic winner
//! - Property encoding (JSON-shaped trees stored as CBOR)
//! - [`CheckpointStore`] for per-pairing replication progress
//! - Database and document listeners, with buffered delivery
//!
//! ## Notification guarantees
//!
//! - One transaction produces one notification batch, never split
//! - Batches reach listeners in commit order
//! - Removing a listener waits for an in-flight callback and prevents all
//!   later ones, including buffered batches

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod codec;
mod config;
mod database;
mod document;
mod error;
mod listener;
mod notify;
mod revision;
mod store;
mod transaction;

pub use checkpoint::{Checkpoint, CheckpointLease, CheckpointStore};
pub use codec::{decode_properties, encode_properties, from_cbor, to_cbor};
pub use config::{DatabaseConfig, DEFAULT_MAX_HISTORY};
pub use database::Database;
pub use document::{
    validate_doc_id, ConcurrencyControl, Document, MutableDocument, Properties, MAX_DOC_ID_LEN,
};
pub use error::{CoreError, CoreResult};
pub use listener::{ListenerRegistry, ListenerToken, Registration};
pub use notify::{
    ChangeBatch, ChangeCallback, CommitObserver, DocumentChange, DocumentChangeCallback,
    ReadyCallback,
};
pub use revision::{ChangeEntry, InsertOutcome, Revision, RevisionId, RevisionInsert};
pub use transaction::Transaction;

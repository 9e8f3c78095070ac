//! # docsync replicator
//!
//! Keeps a local [`docsync_core::Database`] in sync with a peer.
//!
//! This crate provides:
//! - [`Endpoint`] and [`Authenticator`] for addressing and logging in to a
//!   peer
//! - [`ReplicatorConfiguration`] with direction, continuous mode, channel and
//!   document ID restrictions, push/pull filters and [`RetryConfig`]
//! - [`TransferSession`] over a pluggable [`Connector`]: handshake,
//!   certificate pinning and batched revision transfer
//! - [`WebSocketConnector`] for `ws://` and `wss://` peers; `wss` runs over
//!   rustls and a pinned certificate is checked during the TLS handshake
//! - [`Replicator`], the state machine with status and document listeners
//!
//! ## Replication
//!
//! ```text
//! start -> connecting -> busy -> stopped          (one-shot)
//!                         |  ^
//!                         v  |
//!                         idle                    (continuous)
//! ```
//!
//! Each pass pulls first, then pushes. A checkpoint per pairing records how
//! far both directions got; it is written after each acknowledged batch,
//! kept locally and mirrored to the peer. Transient failures put the
//! replicator offline and retry with exponential backoff.
//!
//! ## Conflicts
//!
//! Pulled revisions that conflict with local edits are stored as a second
//! branch and reported with the `conflicted` flag. The deterministic winner
//! (highest generation, then highest digest) becomes the current revision on
//! both sides once both have both branches.
//!
//! ## Frame limits
//!
//! No message may exceed the configured frame length. Batches are split to
//! fit, and a single revision too large for any frame is reported for its
//! document with [`ReplicatorError::DocumentTooLarge`] instead of failing
//! the replication.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod checkpoint;
mod config;
mod endpoint;
mod error;
mod pull;
mod push;
mod replicator;
mod session;
mod status;
mod transport;

pub use checkpoint::{checkpoint_id, reconcile};
pub use config::{ReplicationFilter, ReplicatorConfiguration, ReplicatorType, RetryConfig};
pub use endpoint::{Authenticator, Endpoint, Scheme, UrlEndpoint, DEFAULT_COOKIE_NAME};
pub use error::{ReplicatorError, ReplicatorResult};
pub use replicator::Replicator;
pub use session::{
    certificate_fingerprint, verify_pinned_certificate, ReceivedRevisions, TransferSession,
};
pub use status::{
    ActivityLevel, ChangeListener, Direction, DocumentFlags, DocumentListener,
    DocumentReplication, Progress, ReplicatedDocument, ReplicatorStatus,
};
pub use transport::{ConnectOptions, Connection, Connector, LoopbackConnector, WebSocketConnector};

//! # docsync peer
//!
//! The passive side of a replication: answers a replicator's requests
//! against a local [`docsync_core::Database`].
//!
//! This crate provides:
//! - Handshake with basic authentication and signed session cookies
//! - A changes feed filtered by channel and document ID, reporting
//!   documents the reader lost access to
//! - Revs-diff, revision fetch and revision push with conflict refusal
//! - Storage for the replicator's mirrored checkpoints
//! - [`PeerServer`], a threaded WebSocket server, with TLS when given a
//!   certificate and key
//!
//! # Channels
//!
//! A document's channels come from its `channels` property. Users may be
//! restricted to a set of channels; a replicator may further narrow the feed
//! with its own channel list.
//!
//! # Example
//!
//! ```
//! use docsync_core::Database;
//! use docsync_peer::{PeerConfig, PeerHandler, UserAccess};
//!
//! let db = Database::open_in_memory("remote").unwrap();
//! let config = PeerConfig::new().with_user("pupshaw", UserAccess::new("frank"));
//! let handler = PeerHandler::new(db, config);
//! assert!(handler.config().require_auth);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod auth;
mod config;
mod error;
mod handler;
mod server;

pub use auth::{find_cookie, parse_basic_auth, SessionIssuer};
pub use config::{PeerConfig, UserAccess};
pub use error::{PeerError, PeerResult};
pub use handler::{document_channels, PeerHandler, PeerSession, CHANNELS_PROPERTY};
pub use server::{serve_connection, PeerServer};

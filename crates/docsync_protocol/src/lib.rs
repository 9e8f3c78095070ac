//! # docsync protocol
//!
//! Wire protocol shared by the replicator and the peer.
//!
//! This crate provides:
//! - [`Message`] and its payload types, CBOR encoded via serde
//! - [`FrameCodec`] for `u32` length-prefixed frames, and [`chunk_to_fit`]
//!   for keeping messages under the frame limit
//! - [`MessageSocket`], which carries one frame per binary WebSocket
//!   message over a plain or TLS [`NetStream`]
//! - The revision differ ([`classify`], [`winning_revision`], revs-diff)

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod diff;
mod error;
mod frame;
mod messages;
mod socket;

pub use diff::{
    classify, common_ancestor, missing_revisions, possible_ancestors, trim_history,
    winning_revision, RevisionStatus,
};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    chunk_to_fit, FrameBudget, FrameChunks, FrameCodec, DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_LEN,
};
pub use messages::{
    Change, ChangesBatch, DocumentResult, ErrorCode, Hello, HelloReply, Message, MissingRevision,
    ProposedRevision, RevisionPayload, RevisionRequest, SubChanges, WireError, DEFAULT_COOKIE_NAME,
    PROTOCOL_VERSION,
};
pub use socket::{websocket_config, MessageSocket, NetStream};

//! Peer-to-peer sync over a relay.
//!
//! ## Protocol
//!
//! Replicas exchange addressed payloads (`to\n[requestId, kind, body]`):
//! 1. A replica announces its root content hashes (kind 2), or is asked for
//!    them (kind 1)
//! 2. A replica whose hashes differ asks for table, row and cell diffs
//!    (kinds 4, 5, 6) and value diffs (kind 7), one round per level
//! 3. Local changes are pushed to everyone as they happen (kind 3)
//! 4. Every request is answered with kind 0 carrying the same request id

mod client;
mod error;
mod protocol;
mod synchronizer;

pub use client::{build_ws_url, connect};
pub use error::{log_ignored_error, IgnoredErrorHook, SyncError};
pub use protocol::{
    create_payload, create_raw_payload, receive_payload, split_payload, Envelope, MessageKind, MESSAGE_SEPARATOR,
    SERVER_CLIENT_ID,
};
pub use synchronizer::{
    channel, SyncPersistence, Synchronizer, SynchronizerOptions, SynchronizerStats, Transport, TransportHandle,
};

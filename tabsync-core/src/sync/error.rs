//! Sync error types.

use std::sync::Arc;

use tracing::warn;

use super::protocol::MessageKind;
use crate::persist::StorageError;
use crate::store::StoreError;

/// Errors raised while loading, saving or synchronizing a store.
///
/// None of these are fatal: they are handed to an [`IgnoredErrorHook`] and
/// the store stays on its last known good state.
#[derive(Debug)]
pub enum SyncError {
    /// No peer answered a request in time
    Timeout {
        to: Option<String>,
        request_id: String,
        kind: MessageKind,
    },
    /// Malformed envelope or body
    DecodeError(String),
    /// Failed to connect to the relay
    ConnectionError(String),
    /// WebSocket error
    WebSocketError(String),
    /// The transport closed before a message could be sent
    TransportClosed,
    /// Content rejected by the store
    StoreError(StoreError),
    /// Storage backend failure
    StorageError(StorageError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Timeout {
                to,
                request_id,
                kind,
            } => write!(
                f,
                "No response from {} to {}, {}",
                to.as_deref().unwrap_or("anyone"),
                request_id,
                kind
            ),
            SyncError::DecodeError(e) => write!(f, "Decode error: {}", e),
            SyncError::ConnectionError(e) => write!(f, "Connection error: {}", e),
            SyncError::WebSocketError(e) => write!(f, "WebSocket error: {}", e),
            SyncError::TransportClosed => write!(f, "Transport closed"),
            SyncError::StoreError(e) => write!(f, "Store error: {}", e),
            SyncError::StorageError(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::StoreError(e) => Some(e),
            SyncError::StorageError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::StoreError(e)
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        SyncError::StorageError(e)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::DecodeError(e.to_string())
    }
}

/// Receives errors that are reported but otherwise ignored.
pub type IgnoredErrorHook = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// The default hook: log at `warn`.
pub fn log_ignored_error() -> IgnoredErrorHook {
    Arc::new(|error| warn!(%error, "Ignored error"))
}

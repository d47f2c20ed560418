//! Tabsync Core Library
//!
//! A mergeable tabular store and the hash-diff protocol that keeps replicas
//! of it in sync through a relay.

pub mod hash;
pub mod hlc;
pub mod persist;
pub mod schedule;
pub mod stamp;
pub mod store;
pub mod sync;
pub mod tree;

pub use hash::Hash;
pub use hlc::Hlc;
pub use persist::{
    create_key_value_persister, FileStorage, KeyValuePersistence, KeyValuePersister, KeyValueStorage, MemoryStorage,
    Persisted, Persistence, Persister, PersisterStats, PersisterStatus, StorageError,
};
pub use schedule::Scheduler;
pub use stamp::{CellValue, ContentHashes, MergeableChanges, MergeableContent, Stamp};
pub use store::{Content, MergeableStore, Origin, SharedStore, StoreError, StoreEvent, Transaction};
pub use sync::{
    IgnoredErrorHook, MessageKind, SyncError, Synchronizer, SynchronizerOptions, SynchronizerStats, Transport,
    SERVER_CLIENT_ID,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

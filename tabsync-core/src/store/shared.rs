use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use super::MergeableStore;
use crate::stamp::MergeableChanges;

/// Where a batch of accepted changes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A local transaction.
    Local,
    /// Changes or content merged from another replica or from storage.
    Remote,
}

/// Published after every transaction or merge that accepted something.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub origin: Origin,
    /// Stamps of the touched paths, with hashes.
    pub changes: MergeableChanges,
}

/// A store shared between its persisters, synchronizer and callers.
#[derive(Clone, Default)]
pub struct SharedStore(Arc<Mutex<MergeableStore>>);

impl SharedStore {
    pub fn new(store: MergeableStore) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    /// Runs `f` with exclusive access to the store.
    pub fn with<R>(&self, f: impl FnOnce(&mut MergeableStore) -> R) -> R {
        let mut store = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut store)
    }

    /// Identity of the underlying store, stable for its lifetime.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.with(|store| store.subscribe())
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedStore").field(&self.key()).finish()
    }
}

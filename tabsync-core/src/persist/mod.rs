//! Loading and saving stores.
//!
//! A [`Persister`] drives one [`Persistence`] implementation for one store:
//! key-value storage, or a peer reached through a synchronizer. All of its
//! loads and saves go through the shared [`Scheduler`], so at most one runs
//! per store at a time.

mod file;
mod keys;
mod storage;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::schedule::Scheduler;
use crate::stamp::{MergeableChanges, MergeableContent};
use crate::store::{Content, Origin, SharedStore};
use crate::sync::{IgnoredErrorHook, SyncError};

pub use file::FileStorage;
pub use keys::{construct_key, content_from_entries, deconstruct_key, entries_from_content, KeyValuePersistence};
pub use storage::{KeyValueStorage, MemoryStorage, StorageError};

/// What a [`Persistence`] read back.
#[derive(Debug, Clone)]
pub enum Persisted {
    /// A complete snapshot with hashes; replaces the store on load.
    Content(MergeableContent),
    /// Changes to merge into the store.
    Changes(MergeableChanges),
}

/// Where a persister reads content from and writes it to.
pub trait Persistence: Send + Sync + 'static {
    fn get_persisted(&self) -> impl Future<Output = Result<Option<Persisted>, SyncError>> + Send;

    /// Writes `changes`, or the whole store when `changes` is `None`.
    fn set_persisted(
        &self,
        store: &SharedStore,
        changes: Option<MergeableChanges>,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Whether auto-save should persist changes of this origin.
    fn saves_origin(&self, _origin: Origin) -> bool {
        true
    }

    /// How often auto-load re-reads, if the backend cannot push changes.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersisterStatus {
    #[default]
    Idle,
    Loading,
    Saving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PersisterStats {
    pub loads: u64,
    pub saves: u64,
}

#[derive(Default)]
struct State {
    status: PersisterStatus,
    stats: PersisterStats,
    auto_loading: bool,
    auto_load_task: Option<JoinHandle<()>>,
    auto_save_task: Option<JoinHandle<()>>,
}

struct Inner<P> {
    store: SharedStore,
    persistence: P,
    scheduler: Arc<Scheduler>,
    on_ignored_error: IgnoredErrorHook,
    state: Mutex<State>,
}

impl<P> Inner<P> {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: PersisterStatus) {
        let mut state = self.state();
        if state.status != status {
            trace!(?status, "Persister status changed");
            state.status = status;
        }
    }

    /// Moves to `status` unless the opposite operation is in progress.
    fn begin(&self, status: PersisterStatus, blocked_by: PersisterStatus) -> bool {
        let mut state = self.state();
        if state.status == blocked_by {
            return false;
        }
        state.status = status;
        match status {
            PersisterStatus::Loading => state.stats.loads += 1,
            PersisterStatus::Saving => state.stats.saves += 1,
            PersisterStatus::Idle => {}
        }
        true
    }

    fn ignore(&self, error: SyncError) {
        (self.on_ignored_error)(&error);
    }

    fn set_default_content(&self, initial: Option<&Content>) {
        if let Some(initial) = initial {
            if let Err(e) = self.store.with(|store| store.set_default_content(initial).map(|_| ())) {
                self.ignore(e.into());
            }
        }
    }

    fn apply_loaded(&self, loaded: Result<Option<Persisted>, SyncError>, initial: Option<&Content>) {
        match loaded {
            Ok(Some(Persisted::Content(content))) => {
                let set = self
                    .store
                    .with(|store| store.set_mergeable_content(&content).map(|_| ()));
                if let Err(e) = set {
                    self.ignore(e.into());
                    self.set_default_content(initial);
                }
            }
            Ok(Some(Persisted::Changes(changes))) => {
                self.store.with(|store| store.apply_mergeable_changes(&changes));
            }
            Ok(None) => self.set_default_content(initial),
            Err(e) => {
                self.ignore(e);
                self.set_default_content(initial);
            }
        }
    }
}

impl<P> Drop for Inner<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in [state.auto_load_task.take(), state.auto_save_task.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Loads and saves one store through one [`Persistence`].
///
/// Cloning yields another handle to the same persister.
pub struct Persister<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for Persister<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Persistence> Persister<P> {
    pub fn new(
        store: SharedStore,
        persistence: P,
        scheduler: Arc<Scheduler>,
        on_ignored_error: IgnoredErrorHook,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                persistence,
                scheduler,
                on_ignored_error,
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner<P>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub fn persistence(&self) -> &P {
        &self.inner.persistence
    }

    pub fn status(&self) -> PersisterStatus {
        self.inner.state().status
    }

    pub fn stats(&self) -> PersisterStats {
        self.inner.state().stats
    }

    /// Replaces or merges the store with persisted content.
    ///
    /// When nothing is persisted, or reading fails, `initial` is applied as
    /// default content. Skipped while a save is in progress.
    pub async fn load(&self, initial: Option<Content>) {
        if !self.inner.begin(PersisterStatus::Loading, PersisterStatus::Saving) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .scheduler
            .schedule(self.inner.store.key(), async move {
                let loaded = inner.persistence.get_persisted().await;
                inner.apply_loaded(loaded, initial.as_ref());
                inner.set_status(PersisterStatus::Idle);
            })
            .await;
        self.inner.set_status(PersisterStatus::Idle);
    }

    /// Writes `changes`, or the whole store. Skipped while a load is in progress.
    pub async fn save(&self, changes: Option<MergeableChanges>) {
        if !self.inner.begin(PersisterStatus::Saving, PersisterStatus::Loading) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .scheduler
            .schedule(self.inner.store.key(), async move {
                if let Err(e) = inner.persistence.set_persisted(&inner.store, changes).await {
                    inner.ignore(e);
                }
                inner.set_status(PersisterStatus::Idle);
            })
            .await;
        self.inner.set_status(PersisterStatus::Idle);
    }

    /// Merges content that arrived while auto-loading.
    pub fn apply_persisted(&self, persisted: Persisted) {
        let changes = match persisted {
            Persisted::Content(content) => content,
            Persisted::Changes(changes) => changes,
        };
        self.inner.state().stats.loads += 1;
        self.inner.store.with(|store| store.apply_mergeable_changes(&changes));
    }

    /// Loads, then keeps merging newly persisted content into the store.
    pub async fn start_auto_load(&self, initial: Option<Content>) {
        self.stop_auto_load();
        self.load(initial).await;

        let task = self.inner.persistence.poll_interval().map(|interval| {
            let weak = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                let mut ticks = tokio::time::interval(interval);
                ticks.tick().await;
                loop {
                    ticks.tick().await;
                    let Some(persister) = Self::from_weak(&weak) else {
                        break;
                    };
                    persister.poll().await;
                }
            })
        });

        let mut state = self.inner.state();
        state.auto_loading = true;
        state.auto_load_task = task;
    }

    async fn poll(&self) {
        let inner = Arc::clone(&self.inner);
        let read = self
            .inner
            .scheduler
            .schedule(self.inner.store.key(), async move { inner.persistence.get_persisted().await })
            .await;
        match read {
            Some(Ok(Some(persisted))) => self.apply_persisted(persisted),
            Some(Ok(None)) | None => {}
            Some(Err(e)) => self.inner.ignore(e),
        }
    }

    pub fn stop_auto_load(&self) {
        let mut state = self.inner.state();
        state.auto_loading = false;
        if let Some(task) = state.auto_load_task.take() {
            task.abort();
        }
    }

    pub fn is_auto_loading(&self) -> bool {
        self.inner.state().auto_loading
    }

    /// Saves the whole store, then saves every later change as it happens.
    pub async fn start_auto_save(&self) {
        self.stop_auto_save();
        let mut events = self.inner.store.subscribe();
        self.save(None).await;

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                let changes = match events.recv().await {
                    Ok(event) => {
                        let wanted = weak
                            .upgrade()
                            .is_some_and(|inner| inner.persistence.saves_origin(event.origin));
                        if !wanted {
                            continue;
                        }
                        Some(event.changes)
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Store events lagged, saving everything");
                        None
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(persister) = Self::from_weak(&weak) else {
                    break;
                };
                persister.save(changes).await;
            }
        });
        self.inner.state().auto_save_task = Some(task);
    }

    pub fn stop_auto_save(&self) {
        if let Some(task) = self.inner.state().auto_save_task.take() {
            task.abort();
        }
    }

    pub fn is_auto_saving(&self) -> bool {
        self.inner.state().auto_save_task.is_some()
    }

    /// Stops auto-loading and auto-saving and drops queued actions for the store.
    pub fn destroy(&self) {
        self.inner.scheduler.clear(self.inner.store.key());
        self.stop_auto_load();
        self.stop_auto_save();
    }
}

/// A persister writing to key-value storage.
pub type KeyValuePersister = Persister<KeyValuePersistence>;

/// Creates a persister storing `store` under `prefix` in `storage`.
pub fn create_key_value_persister(
    store: SharedStore,
    storage: Arc<dyn KeyValueStorage>,
    prefix: impl Into<String>,
    scheduler: Arc<Scheduler>,
    on_ignored_error: IgnoredErrorHook,
) -> KeyValuePersister {
    Persister::new(
        store,
        KeyValuePersistence::new(storage, prefix),
        scheduler,
        on_ignored_error,
    )
}

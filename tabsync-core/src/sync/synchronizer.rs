//! Synchronizing a store with peers over an addressed-message transport.
//!
//! A [`Synchronizer`] is a persister whose "storage" is every other peer on
//! the transport. Loading runs the hash-diff protocol against whichever peer
//! answers first; saving broadcasts either pushed changes or an announcement
//! of this replica's content hashes, which prompts peers to reconcile.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::error::{log_ignored_error, IgnoredErrorHook, SyncError};
use super::protocol::{create_payload, receive_payload, Envelope, MessageKind};
use crate::hlc::unique_id;
use crate::persist::{Persisted, Persistence, Persister};
use crate::schedule::Scheduler;
use crate::stamp::{
    CellHashes, ContentHashes, FoldStamp, MergeableChanges, RowDiff, RowHashes, TableDiff, TableHashes, TablesStamp,
    ValueHashes, ValuesStamp,
};
use crate::store::{retain_known, Content, Origin, SharedStore};

const TRANSACTION_ID_LENGTH: usize = 11;
const REQUEST_SUFFIX_LENGTH: usize = 4;

/// One end of a bidirectional payload channel.
///
/// Outbound payloads are addressed (`to\npacket`); inbound payloads carry the
/// sender's id in the same position.
#[derive(Debug)]
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// The far end of a [`channel`] transport.
#[derive(Debug)]
pub struct TransportHandle {
    /// Payloads the synchronizer sent.
    pub sent: mpsc::UnboundedReceiver<String>,
    /// Delivers payloads to the synchronizer.
    pub deliver: mpsc::UnboundedSender<String>,
}

/// An in-process transport, for relays that host replicas and for tests.
pub fn channel() -> (Transport, TransportHandle) {
    let (outbound, sent) = mpsc::unbounded_channel();
    let (deliver, inbound) = mpsc::unbounded_channel();
    (Transport { outbound, inbound }, TransportHandle { sent, deliver })
}

#[derive(Clone)]
pub struct SynchronizerOptions {
    /// How long to wait for a response before giving up on a request.
    pub request_timeout: Duration,
    pub on_ignored_error: IgnoredErrorHook,
}

impl Default for SynchronizerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            on_ignored_error: log_ignored_error(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SynchronizerStats {
    pub sends: u64,
    pub receives: u64,
}

type PendingRequest = (Option<String>, oneshot::Sender<(Value, String)>);

struct Shared {
    store: SharedStore,
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    request_timeout: Duration,
    on_ignored_error: IgnoredErrorHook,
    syncing: AtomicBool,
    sends: AtomicU64,
    receives: AtomicU64,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn send<B: Serialize>(
        &self,
        to: Option<&str>,
        request_id: Option<&str>,
        kind: MessageKind,
        body: &B,
    ) -> Result<(), SyncError> {
        let payload = create_payload(to, request_id, kind, body)?;
        trace!(to = to.unwrap_or(""), %kind, "Sending");
        self.outbound
            .send(payload)
            .map_err(|_| SyncError::TransportClosed)?;
        self.sends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn respond<B: Serialize>(&self, envelope: &Envelope, body: &B) -> Result<(), SyncError> {
        self.send(
            Some(&envelope.client_id),
            envelope.request_id.as_deref(),
            MessageKind::Response,
            body,
        )
    }

    /// Sends a request and waits for its response.
    ///
    /// Returns the decoded body and the id of the peer that answered.
    async fn request<T: DeserializeOwned, B: Serialize>(
        &self,
        to: Option<&str>,
        kind: MessageKind,
        body: &B,
        transaction_id: &str,
    ) -> Result<(T, String), SyncError> {
        let request_id = format!("{transaction_id}.{}", unique_id(REQUEST_SUFFIX_LENGTH));
        let (tx, rx) = oneshot::channel();
        self.pending()
            .insert(request_id.clone(), (to.map(str::to_string), tx));

        if let Err(e) = self.send(to, Some(&request_id), kind, body) {
            self.pending().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok((body, from))) => Ok((serde_json::from_value(body)?, from)),
            Ok(Err(_)) => Err(SyncError::TransportClosed),
            Err(_) => {
                self.pending().remove(&request_id);
                Err(SyncError::Timeout {
                    to: to.map(str::to_string),
                    request_id,
                    kind,
                })
            }
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, envelope: Envelope) {
        let Some(request_id) = envelope.request_id else {
            return;
        };
        let mut pending = self.pending();
        let expected = match pending.get(&request_id) {
            Some((expected, _)) => expected.as_deref(),
            None => return,
        };
        if expected.is_some_and(|expected| expected != envelope.client_id) {
            return;
        }
        if let Some((_, resolve)) = pending.remove(&request_id) {
            let _ = resolve.send((envelope.body, envelope.client_id));
        }
    }

    /// Runs the hash-diff protocol against another replica.
    ///
    /// With no `other_hashes`, first broadcasts a content-hash request and
    /// continues with whichever peer answers. Diff responses about ids that
    /// were never asked about are dropped.
    async fn get_changes_from_other_store(
        &self,
        other: Option<String>,
        other_hashes: Option<ContentHashes>,
        transaction_id: Option<String>,
    ) -> Result<MergeableChanges, SyncError> {
        let transaction_id = transaction_id.unwrap_or_else(|| unique_id(TRANSACTION_ID_LENGTH));
        let (other_hashes, other) = match other_hashes {
            Some(hashes) => (hashes, other),
            None => {
                let (hashes, from) = self
                    .request::<ContentHashes, _>(
                        other.as_deref(),
                        MessageKind::RequestContentHashes,
                        &"",
                        &transaction_id,
                    )
                    .await?;
                (hashes, Some(from))
            }
        };
        let other = other.as_deref();
        let hashes = self.store.with(|store| store.get_mergeable_content_hashes());

        let mut tables = TablesStamp::default();
        if hashes.tables() != other_hashes.tables() {
            let table_hashes = self.store.with(|store| store.get_mergeable_table_hashes());
            let ((new_tables, mut differing_tables), _) = self
                .request::<TableDiff, _>(other, MessageKind::RequestTableDiff, &table_hashes, &transaction_id)
                .await?;
            tables = new_tables;
            retain_known(&mut differing_tables, &table_hashes);

            if !differing_tables.is_empty() {
                let row_hashes = self.store.with(|store| store.get_mergeable_row_hashes(&differing_tables));
                let ((mut new_rows, mut differing_rows), _) = self
                    .request::<RowDiff, _>(other, MessageKind::RequestRowDiff, &row_hashes, &transaction_id)
                    .await?;
                retain_known(&mut new_rows.value, &row_hashes);
                retain_known(&mut differing_rows, &row_hashes);
                for (table_id, rows) in differing_rows.iter_mut() {
                    if let Some(asked) = row_hashes.get(table_id) {
                        retain_known(rows, asked);
                    }
                }
                tables.fold(new_rows);

                if differing_rows.values().any(|rows| !rows.is_empty()) {
                    let cell_hashes = self.store.with(|store| store.get_mergeable_cell_hashes(&differing_rows));
                    let (mut new_cells, _) = self
                        .request::<TablesStamp, _>(other, MessageKind::RequestCellDiff, &cell_hashes, &transaction_id)
                        .await?;
                    retain_asked_rows(&mut new_cells, &cell_hashes);
                    tables.fold(new_cells);
                }
            }
        }

        let mut values = ValuesStamp::default();
        if hashes.values() != other_hashes.values() {
            let value_hashes = self.store.with(|store| store.get_mergeable_value_hashes());
            let (new_values, _) = self
                .request::<ValuesStamp, _>(other, MessageKind::RequestValueDiff, &value_hashes, &transaction_id)
                .await?;
            values = new_values;
        }

        Ok(MergeableChanges::new(tables, values))
    }

    /// Answers a request addressed to this replica.
    fn answer(&self, envelope: &Envelope) -> Result<(), SyncError> {
        match envelope.kind {
            MessageKind::RequestContentHashes => {
                let hashes = self.store.with(|store| store.get_mergeable_content_hashes());
                self.respond(envelope, &hashes)
            }
            MessageKind::RequestTableDiff => {
                let asked: TableHashes = serde_json::from_value(envelope.body.clone())?;
                let diff = self.store.with(|store| store.get_mergeable_table_diff(&asked));
                self.respond(envelope, &diff)
            }
            MessageKind::RequestRowDiff => {
                let asked: RowHashes = serde_json::from_value(envelope.body.clone())?;
                let diff = self.store.with(|store| store.get_mergeable_row_diff(&asked));
                self.respond(envelope, &diff)
            }
            MessageKind::RequestCellDiff => {
                let asked: CellHashes = serde_json::from_value(envelope.body.clone())?;
                let diff = self.store.with(|store| store.get_mergeable_cell_diff(&asked));
                self.respond(envelope, &diff)
            }
            MessageKind::RequestValueDiff => {
                let asked: ValueHashes = serde_json::from_value(envelope.body.clone())?;
                let diff = self.store.with(|store| store.get_mergeable_value_diff(&asked));
                self.respond(envelope, &diff)
            }
            _ => Ok(()),
        }
    }
}

/// Drops cells of tables and rows that were not part of the cell-hash request.
fn retain_asked_rows(tables: &mut TablesStamp, asked: &CellHashes) {
    retain_known(&mut tables.value, asked);
    for (table_id, table) in tables.value.iter_mut() {
        if let Some(asked_rows) = asked.get(table_id) {
            retain_known(&mut table.value, asked_rows);
        }
    }
}

/// Persistence backed by the peers on a transport.
pub struct SyncPersistence {
    shared: Arc<Shared>,
}

impl Persistence for SyncPersistence {
    fn get_persisted(&self) -> impl Future<Output = Result<Option<Persisted>, SyncError>> + Send {
        async move {
            let changes = self.shared.get_changes_from_other_store(None, None, None).await?;
            Ok((!changes.is_empty()).then_some(Persisted::Changes(changes)))
        }
    }

    fn set_persisted(
        &self,
        store: &SharedStore,
        changes: Option<MergeableChanges>,
    ) -> impl Future<Output = Result<(), SyncError>> + Send {
        let transaction_id = unique_id(TRANSACTION_ID_LENGTH);
        let sent = match changes {
            Some(changes) => self.shared.send(
                None,
                Some(&transaction_id),
                MessageKind::PushChanges,
                &changes.without_hashes(),
            ),
            None => {
                let hashes = store.with(|store| store.get_mergeable_content_hashes());
                self.shared
                    .send(None, Some(&transaction_id), MessageKind::AnnounceContentHashes, &hashes)
            }
        };
        async move { sent }
    }

    fn saves_origin(&self, origin: Origin) -> bool {
        origin == Origin::Local
    }
}

/// Keeps a store in sync with every other replica on a transport.
#[derive(Clone)]
pub struct Synchronizer {
    persister: Persister<SyncPersistence>,
    shared: Arc<Shared>,
}

impl Synchronizer {
    /// Wraps `store` and starts handling inbound payloads from `transport`.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        store: SharedStore,
        transport: Transport,
        options: SynchronizerOptions,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let shared = Arc::new(Shared {
            store: store.clone(),
            outbound: transport.outbound,
            pending: Mutex::new(HashMap::new()),
            request_timeout: options.request_timeout,
            on_ignored_error: options.on_ignored_error.clone(),
            syncing: AtomicBool::new(false),
            sends: AtomicU64::new(0),
            receives: AtomicU64::new(0),
            receiver: Mutex::new(None),
        });
        let persister = Persister::new(
            store,
            SyncPersistence {
                shared: Arc::clone(&shared),
            },
            scheduler,
            options.on_ignored_error,
        );
        let synchronizer = Self { persister, shared };

        let receiver = tokio::spawn(synchronizer.clone().receive_loop(transport.inbound));
        *synchronizer
            .shared
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(receiver);
        synchronizer
    }

    async fn receive_loop(self, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(payload) = inbound.recv().await {
            self.receive(&payload);
        }
        debug!("Transport closed, synchronizer stopped receiving");
    }

    fn ignore(&self, error: SyncError) {
        (self.shared.on_ignored_error)(&error);
    }

    fn receive(&self, payload: &str) {
        let envelope = match receive_payload(payload) {
            Ok(envelope) => envelope,
            Err(e) => return self.ignore(e.into()),
        };
        self.shared.receives.fetch_add(1, Ordering::Relaxed);
        trace!(from = %envelope.client_id, kind = %envelope.kind, "Received");

        let result = match envelope.kind {
            MessageKind::Response => {
                self.shared.resolve(envelope);
                Ok(())
            }
            MessageKind::AnnounceContentHashes => {
                if self.is_syncing() || self.persister.is_auto_loading() {
                    self.reconcile_with(envelope)
                } else {
                    Ok(())
                }
            }
            MessageKind::PushChanges => {
                if self.persister.is_auto_loading() {
                    serde_json::from_value::<MergeableChanges>(envelope.body)
                        .map(|changes| self.persister.apply_persisted(Persisted::Changes(changes)))
                        .map_err(SyncError::from)
                } else {
                    Ok(())
                }
            }
            // Hash and diff requests are only answered while this replica syncs.
            _ => {
                if self.is_syncing() || self.persister.is_auto_saving() {
                    self.shared.answer(&envelope)
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            self.ignore(e);
        }
    }

    /// Runs the diff protocol against a peer that announced its hashes.
    ///
    /// The responses arrive through this same receive loop, so the protocol
    /// runs on its own task.
    fn reconcile_with(&self, envelope: Envelope) -> Result<(), SyncError> {
        let hashes: ContentHashes = serde_json::from_value(envelope.body)?;
        let synchronizer = self.clone();
        tokio::spawn(async move {
            let changes = synchronizer
                .shared
                .get_changes_from_other_store(Some(envelope.client_id), Some(hashes), envelope.request_id)
                .await;
            match changes {
                Ok(changes) if !changes.is_empty() => {
                    synchronizer.persister.apply_persisted(Persisted::Changes(changes));
                }
                Ok(_) => {}
                Err(e) => synchronizer.ignore(e),
            }
        });
        Ok(())
    }

    /// Loads from peers (falling back to `initial`), then keeps pushing local
    /// changes and merging remote ones.
    pub async fn start_sync(&self, initial: Option<Content>) {
        self.shared.syncing.store(true, Ordering::SeqCst);
        self.persister.start_auto_load(initial).await;
        self.persister.start_auto_save().await;
    }

    pub fn stop_sync(&self) {
        self.shared.syncing.store(false, Ordering::SeqCst);
        self.persister.stop_auto_load();
        self.persister.stop_auto_save();
    }

    pub fn is_syncing(&self) -> bool {
        self.shared.syncing.load(Ordering::SeqCst)
    }

    /// Fetches changes another replica has that this one lacks, without
    /// applying them.
    pub async fn get_changes_from_other_store(
        &self,
        other: Option<&str>,
        other_hashes: Option<ContentHashes>,
    ) -> Result<MergeableChanges, SyncError> {
        self.shared
            .get_changes_from_other_store(other.map(str::to_string), other_hashes, None)
            .await
    }

    pub fn persister(&self) -> &Persister<SyncPersistence> {
        &self.persister
    }

    pub fn store(&self) -> &SharedStore {
        self.persister.store()
    }

    pub fn stats(&self) -> SynchronizerStats {
        SynchronizerStats {
            sends: self.shared.sends.load(Ordering::Relaxed),
            receives: self.shared.receives.load(Ordering::Relaxed),
        }
    }

    /// Stops syncing and receiving. Pending requests fail as the transport
    /// closed.
    pub fn destroy(&self) {
        self.stop_sync();
        self.persister.destroy();
        if let Some(receiver) = self
            .shared
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            receiver.abort();
        }
        self.shared.pending().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::stamp::CellValue;
    use crate::store::MergeableStore;
    use crate::sync::protocol::{create_raw_payload, split_payload};

    fn synchronizer(tag: &str) -> (Synchronizer, TransportHandle) {
        let (transport, handle) = channel();
        let store = SharedStore::new(MergeableStore::new(Some(tag)));
        let options = SynchronizerOptions {
            request_timeout: Duration::from_millis(200),
            ..SynchronizerOptions::default()
        };
        (Synchronizer::new(store, transport, options, Scheduler::new()), handle)
    }

    /// A synchronizer that answers requests, with its opening announcement drained.
    async fn answering(tag: &str) -> (Synchronizer, TransportHandle) {
        let (synchronizer, mut handle) = synchronizer(tag);
        synchronizer.persister().start_auto_save().await;
        let (_, kind, _) = next_sent(&mut handle).await;
        assert_eq!(kind, MessageKind::AnnounceContentHashes);
        (synchronizer, handle)
    }

    async fn next_sent(handle: &mut TransportHandle) -> (Option<String>, MessageKind, Value) {
        let sent = handle.sent.recv().await.unwrap();
        let (_, packet) = split_payload(&sent).unwrap();
        serde_json::from_str(packet).unwrap()
    }

    fn reply<B: Serialize>(handle: &TransportHandle, from: &str, request_id: &str, body: &B) {
        let packet = serde_json::to_string(&(request_id, MessageKind::Response, body)).unwrap();
        handle.deliver.send(create_raw_payload(from, &packet)).unwrap();
    }

    /// Starts a diff against "b" from a replica holding `pets/fido`.
    fn start_diff(synchronizer: &Synchronizer) -> JoinHandle<Result<MergeableChanges, SyncError>> {
        synchronizer
            .store()
            .with(|s| s.set_cell("pets", "fido", "legs", 4).map(|_| ()))
            .unwrap();
        let requester = synchronizer.clone();
        tokio::spawn(async move {
            requester
                .get_changes_from_other_store(Some("b"), Some(ContentHashes(1, 0)))
                .await
        })
    }

    /// Tables `pets` (rows `fido` and `rex`) and `evil`, as another replica has them.
    fn peer_tables() -> TablesStamp {
        let mut peer = MergeableStore::new(Some("b"));
        peer.transaction(|tx| {
            tx.set_cell("pets", "fido", "legs", 3);
            tx.set_cell("pets", "rex", "legs", 4);
            tx.set_cell("evil", "x", "c", 1);
        })
        .unwrap();
        peer.get_mergeable_content().tables
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (synchronizer, mut handle) = synchronizer("a");
        let result = synchronizer.get_changes_from_other_store(None, None).await;
        assert!(matches!(
            result,
            Err(SyncError::Timeout {
                to: None,
                kind: MessageKind::RequestContentHashes,
                ..
            })
        ));
        let sent = handle.sent.recv().await.unwrap();
        assert!(sent.starts_with("\n["));
        assert!(synchronizer.shared.pending().is_empty());
    }

    #[tokio::test]
    async fn test_answers_diff_requests() {
        let (synchronizer, mut handle) = answering("a").await;
        synchronizer
            .store()
            .with(|s| s.set_cell("pets", "fido", "legs", 4).map(|_| ()))
            .unwrap();

        handle.deliver.send("peer\n[\"tx.1\",4,{}]".to_string()).unwrap();
        let sent = handle.sent.recv().await.unwrap();
        let (to, packet) = split_payload(&sent).unwrap();
        assert_eq!(to, "peer");
        let (request_id, kind, (new_tables, differing)): (String, MessageKind, TableDiff) =
            serde_json::from_str(packet).unwrap();
        assert_eq!(request_id, "tx.1");
        assert_eq!(kind, MessageKind::Response);
        assert!(new_tables.value.contains_key("pets"));
        assert!(differing.is_empty());
        assert_eq!(synchronizer.stats(), SynchronizerStats { sends: 2, receives: 1 });
    }

    #[tokio::test]
    async fn test_ignores_hash_requests_when_not_syncing() {
        let (synchronizer, mut handle) = synchronizer("a");
        handle.deliver.send("peer\n[\"tx.1\",1,\"\"]".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.sent.try_recv().is_err());
        assert_eq!(synchronizer.stats().receives, 1);
    }

    #[tokio::test]
    async fn test_ignores_diff_requests_when_not_syncing() {
        let (synchronizer, mut handle) = synchronizer("a");
        for request in ["[\"tx.1\",4,{}]", "[\"tx.2\",5,{}]", "[\"tx.3\",6,{}]", "[\"tx.4\",7,{}]"] {
            handle.deliver.send(create_raw_payload("peer", request)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.sent.try_recv().is_err());
        assert_eq!(synchronizer.stats().receives, 4);

        synchronizer.persister().start_auto_save().await;
        let (_, kind, _) = next_sent(&mut handle).await;
        assert_eq!(kind, MessageKind::AnnounceContentHashes);
        handle.deliver.send(create_raw_payload("peer", "[\"tx.5\",7,{}]")).unwrap();
        let (request_id, kind, _) = next_sent(&mut handle).await;
        assert_eq!(request_id.as_deref(), Some("tx.5"));
        assert_eq!(kind, MessageKind::Response);
    }

    #[tokio::test]
    async fn test_table_diff_drops_unasked_tables() {
        let (synchronizer, mut handle) = synchronizer("a");
        let diff = start_diff(&synchronizer);

        let (request_id, kind, _) = next_sent(&mut handle).await;
        assert_eq!(kind, MessageKind::RequestTableDiff);
        let differing: TableHashes = [("evil".to_string(), 5)].into();
        reply(&handle, "b", &request_id.unwrap(), &(TablesStamp::default(), differing));

        let changes = diff.await.unwrap().unwrap();
        assert!(changes.is_empty());
        assert!(handle.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_row_diff_drops_unasked_tables_and_rows() {
        let (synchronizer, mut handle) = synchronizer("a");
        let diff = start_diff(&synchronizer);

        let (request_id, _, _) = next_sent(&mut handle).await;
        let differing: TableHashes = [("pets".to_string(), 5)].into();
        reply(&handle, "b", &request_id.unwrap(), &(TablesStamp::default(), differing));

        let (request_id, kind, asked) = next_sent(&mut handle).await;
        assert_eq!(kind, MessageKind::RequestRowDiff);
        let asked: RowHashes = serde_json::from_value(asked).unwrap();
        assert_eq!(asked["pets"].keys().collect::<Vec<_>>(), vec!["fido"]);

        let mut new_rows = peer_tables();
        new_rows.value.get_mut("pets").unwrap().value.remove("fido");
        let differing: RowHashes = [
            ("pets".to_string(), BTreeMap::from([("ghost".to_string(), 7)])),
            ("evil".to_string(), BTreeMap::from([("x".to_string(), 7)])),
        ]
        .into();
        reply(&handle, "b", &request_id.unwrap(), &(new_rows, differing));

        let changes = diff.await.unwrap().unwrap();
        assert_eq!(changes.tables.value.keys().collect::<Vec<_>>(), vec!["pets"]);
        assert_eq!(changes.tables.value["pets"].value.keys().collect::<Vec<_>>(), vec!["rex"]);
        assert!(handle.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cell_diff_drops_unasked_rows() {
        let (synchronizer, mut handle) = synchronizer("a");
        let diff = start_diff(&synchronizer);

        let (request_id, _, _) = next_sent(&mut handle).await;
        let differing: TableHashes = [("pets".to_string(), 5)].into();
        reply(&handle, "b", &request_id.unwrap(), &(TablesStamp::default(), differing));

        let (request_id, _, _) = next_sent(&mut handle).await;
        let differing: RowHashes = [("pets".to_string(), BTreeMap::from([("fido".to_string(), 7)]))].into();
        reply(&handle, "b", &request_id.unwrap(), &(TablesStamp::default(), differing));

        let (request_id, kind, _) = next_sent(&mut handle).await;
        assert_eq!(kind, MessageKind::RequestCellDiff);
        reply(&handle, "b", &request_id.unwrap(), &peer_tables());

        let changes = diff.await.unwrap().unwrap();
        assert_eq!(changes.tables.value.keys().collect::<Vec<_>>(), vec!["pets"]);
        let pets = &changes.tables.value["pets"].value;
        assert_eq!(pets.keys().collect::<Vec<_>>(), vec!["fido"]);
        assert_eq!(pets["fido"].value["legs"].value, Some(CellValue::from(3)));
    }

    #[tokio::test]
    async fn test_later_response_from_other_peer_is_ignored() {
        let (synchronizer, mut handle) = synchronizer("a");
        let diff = start_diff(&synchronizer);

        let (request_id, _, _) = next_sent(&mut handle).await;
        let differing: TableHashes = [("pets".to_string(), 5)].into();
        reply(&handle, "b", &request_id.unwrap(), &(TablesStamp::default(), differing));

        let (request_id, kind, _) = next_sent(&mut handle).await;
        assert_eq!(kind, MessageKind::RequestRowDiff);
        reply(&handle, "c", &request_id.unwrap(), &(peer_tables(), RowHashes::new()));

        assert!(matches!(
            diff.await.unwrap(),
            Err(SyncError::Timeout {
                kind: MessageKind::RequestRowDiff,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_response_from_wrong_peer_is_ignored() {
        let (synchronizer, mut handle) = synchronizer("a");
        let requester = synchronizer.clone();
        let request = tokio::spawn(async move {
            requester
                .get_changes_from_other_store(Some("b"), Some(ContentHashes(1, 0)))
                .await
        });

        let sent = handle.sent.recv().await.unwrap();
        let (_, packet) = split_payload(&sent).unwrap();
        let (request_id, _, _): (String, MessageKind, Value) = serde_json::from_str(packet).unwrap();
        let reply = format!("[\"{request_id}\",0,[[{{}},\"\"],{{}}]]");
        handle.deliver.send(create_raw_payload("c", &reply)).unwrap();

        assert!(matches!(request.await.unwrap(), Err(SyncError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_push_changes_applied_only_while_auto_loading() {
        let (synchronizer, handle) = synchronizer("a");
        let mut other = MergeableStore::new(Some("b"));
        other.set_value("open", true).unwrap();
        let changes = serde_json::to_string(&other.get_mergeable_content().without_hashes()).unwrap();
        let payload = create_raw_payload("b", &format!("[null,3,{changes}]"));

        handle.deliver.send(payload.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(synchronizer.store().with(|s| s.get_value("open").cloned()), None);

        // Nobody answers the initial load, so it falls back after the timeout.
        synchronizer.start_sync(None).await;
        handle.deliver.send(payload).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            synchronizer.store().with(|s| s.get_value("open").cloned()),
            Some(CellValue::Boolean(true))
        );
        synchronizer.destroy();
        assert!(!synchronizer.is_syncing());
    }

    #[tokio::test]
    async fn test_malformed_payload_reaches_hook() {
        let (transport, handle) = channel();
        let errors = Arc::new(AtomicU64::new(0));
        let counter = errors.clone();
        let options = SynchronizerOptions {
            on_ignored_error: Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            ..SynchronizerOptions::default()
        };
        let synchronizer = Synchronizer::new(SharedStore::default(), transport, options, Scheduler::new());
        synchronizer.persister().start_auto_save().await;

        handle.deliver.send("garbage".to_string()).unwrap();
        handle.deliver.send("peer\n[null,4,\"not hashes\"]".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(synchronizer.stats().receives, 1);
    }
}

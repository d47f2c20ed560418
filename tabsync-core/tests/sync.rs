use std::sync::{Arc, Mutex};
use std::time::Duration;

use tabsync_core::sync::{channel, create_raw_payload, receive_payload, split_payload, TransportHandle};
use tabsync_core::{
    CellValue, ContentHashes, MergeableStore, MessageKind, Scheduler, SharedStore, SyncError, Synchronizer,
    SynchronizerOptions,
};
use tokio::sync::mpsc;

/// Payloads routed between replicas: (from, to, kind).
type Traffic = Arc<Mutex<Vec<(String, String, MessageKind)>>>;

/// Routes payloads between synchronizers the way a relay does.
struct Bus {
    scheduler: Arc<Scheduler>,
    register: mpsc::UnboundedSender<(String, mpsc::UnboundedSender<String>)>,
    inbox: mpsc::UnboundedSender<(String, String)>,
    traffic: Traffic,
}

impl Bus {
    fn new() -> Self {
        let (register, mut registrations) = mpsc::unbounded_channel::<(String, mpsc::UnboundedSender<String>)>();
        let (inbox, mut messages) = mpsc::unbounded_channel::<(String, String)>();
        let traffic: Traffic = Arc::default();
        let log = traffic.clone();

        tokio::spawn(async move {
            let mut peers: Vec<(String, mpsc::UnboundedSender<String>)> = Vec::new();
            loop {
                tokio::select! {
                    biased;
                    Some(peer) = registrations.recv() => peers.push(peer),
                    Some((from, payload)) = messages.recv() => {
                        let Some((to, remainder)) = split_payload(&payload) else {
                            continue;
                        };
                        let forwarded = create_raw_payload(&from, remainder);
                        if let Ok(envelope) = receive_payload(&forwarded) {
                            log.lock().unwrap().push((from.clone(), to.to_string(), envelope.kind));
                        }
                        for (id, deliver) in &peers {
                            if *id != from && (to.is_empty() || to == id) {
                                let _ = deliver.send(forwarded.clone());
                            }
                        }
                    }
                    else => break,
                }
            }
        });

        Self {
            scheduler: Scheduler::new(),
            register,
            inbox,
            traffic,
        }
    }

    fn join(&self, id: &str, store: MergeableStore) -> Synchronizer {
        let (transport, TransportHandle { mut sent, deliver }) = channel();
        self.register.send((id.to_string(), deliver)).unwrap();
        let inbox = self.inbox.clone();
        let from = id.to_string();
        tokio::spawn(async move {
            while let Some(payload) = sent.recv().await {
                let _ = inbox.send((from.clone(), payload));
            }
        });
        let options = SynchronizerOptions {
            request_timeout: Duration::from_millis(300),
            ..SynchronizerOptions::default()
        };
        Synchronizer::new(SharedStore::new(store), transport, options, self.scheduler.clone())
    }

    /// Lets `replica` answer diff requests, then forgets the traffic that caused.
    async fn answer_with(&self, replica: &Synchronizer) {
        replica.persister().start_auto_save().await;
        settle().await;
        self.traffic.lock().unwrap().clear();
    }

    fn kinds(&self) -> Vec<MessageKind> {
        self.traffic.lock().unwrap().iter().map(|(_, _, kind)| *kind).collect()
    }
}

fn groceries(tag: &str) -> MergeableStore {
    let mut store = MergeableStore::new(Some(tag));
    store
        .transaction(|tx| {
            for row in 0..50 {
                tx.set_cell("groceries", &row.to_string(), "qty", row);
                tx.set_cell("groceries", &row.to_string(), "name", format!("item {row}"));
            }
            for row in 0..10 {
                tx.set_cell("pantry", &row.to_string(), "stocked", true);
            }
            tx.set_value("shop", "corner");
        })
        .unwrap();
    store
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn diff_transfers_only_the_changed_cell() {
    let bus = Bus::new();
    let a_store = groceries("a");
    let mut b_store = MergeableStore::new(Some("b"));
    b_store.set_mergeable_content(&a_store.get_mergeable_content()).unwrap();
    b_store.set_cell("groceries", "42", "qty", 7).unwrap();

    let a = bus.join("a", a_store);
    let b = bus.join("b", b_store);
    bus.answer_with(&b).await;
    let b_hashes = b.store().with(|s| s.get_mergeable_content_hashes());

    let changes = a.get_changes_from_other_store(Some("b"), Some(b_hashes)).await.unwrap();

    assert_eq!(changes.tables.value.len(), 1);
    let rows = &changes.tables.value["groceries"].value;
    assert_eq!(rows.len(), 1);
    let cells = &rows["42"].value;
    assert_eq!(cells.len(), 1);
    assert_eq!(cells["qty"].value, Some(CellValue::from(7)));
    assert!(changes.values.value.is_empty());

    assert_eq!(
        bus.kinds(),
        vec![
            MessageKind::RequestTableDiff,
            MessageKind::Response,
            MessageKind::RequestRowDiff,
            MessageKind::Response,
            MessageKind::RequestCellDiff,
            MessageKind::Response,
        ]
    );

    a.store().with(|s| s.apply_mergeable_changes(&changes));
    assert_eq!(
        a.store().with(|s| s.get_mergeable_content()),
        b.store().with(|s| s.get_mergeable_content())
    );
}

#[tokio::test]
async fn idle_replica_does_not_answer_diffs() {
    let bus = Bus::new();
    let a = bus.join("a", MergeableStore::new(Some("a")));
    let _b = bus.join("b", groceries("b"));

    let result = a.get_changes_from_other_store(Some("b"), Some(ContentHashes(1, 0))).await;
    assert!(matches!(
        result,
        Err(SyncError::Timeout {
            kind: MessageKind::RequestTableDiff,
            ..
        })
    ));
    assert_eq!(bus.kinds(), vec![MessageKind::RequestTableDiff]);
}

#[tokio::test]
async fn identical_stores_exchange_nothing() {
    let bus = Bus::new();
    let a_store = groceries("a");
    let mut b_store = MergeableStore::new(Some("b"));
    b_store.set_mergeable_content(&a_store.get_mergeable_content()).unwrap();

    let a = bus.join("a", a_store);
    let b = bus.join("b", b_store);
    bus.answer_with(&b).await;
    let hashes = b.store().with(|s| s.get_mergeable_content_hashes());

    let changes = a.get_changes_from_other_store(Some("b"), Some(hashes)).await.unwrap();
    assert!(changes.is_empty());
    assert!(bus.kinds().is_empty());
}

#[tokio::test]
async fn late_joiner_bootstraps_and_pushes_flow() {
    let bus = Bus::new();
    let a = bus.join("a", groceries("a"));
    let b = bus.join("b", MergeableStore::new(Some("b")));
    a.start_sync(None).await;

    b.start_sync(None).await;
    let c = bus.join("c", MergeableStore::new(Some("c")));
    c.start_sync(None).await;
    settle().await;

    let content = a.store().with(|s| s.get_content());
    assert_eq!(b.store().with(|s| s.get_content()), content);
    assert_eq!(c.store().with(|s| s.get_content()), content);

    b.store().with(|s| s.set_value("shop", "market").map(|_| ())).unwrap();
    settle().await;
    for replica in [&a, &c] {
        assert_eq!(
            replica.store().with(|s| s.get_value("shop").cloned()),
            Some(CellValue::from("market"))
        );
    }
    assert!(bus.kinds().contains(&MessageKind::PushChanges));
    assert!(b.stats().sends > 0);
}

#[tokio::test]
async fn stopped_replica_stops_receiving_pushes() {
    let bus = Bus::new();
    let a = bus.join("a", MergeableStore::new(Some("a")));
    let b = bus.join("b", MergeableStore::new(Some("b")));
    tokio::join!(a.start_sync(None), b.start_sync(None));

    b.stop_sync();
    a.store().with(|s| s.set_value("open", true).map(|_| ())).unwrap();
    settle().await;

    assert_eq!(b.store().with(|s| s.get_value("open").cloned()), None);
    assert!(!b.is_syncing());
}

//! Per-topic relay.
//!
//! Each topic is served by one actor task that owns the topic's connection
//! registry and an embedded server replica. The replica is a synchronizer
//! like any client, addressed as [`SERVER_CLIENT_ID`], whose store is also
//! persisted to the topic's durable storage so late joiners can bootstrap
//! from it.
//!
//! Actors start lazily on the first connection and exit once their last
//! client has left and the replica has been saved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tabsync_core::sync::{
    channel, create_payload, create_raw_payload, log_ignored_error, receive_payload, split_payload,
};
use tabsync_core::{
    create_key_value_persister, FileStorage, KeyValuePersister, MergeableStore, MessageKind, Scheduler, SharedStore,
    Synchronizer, SynchronizerOptions, SERVER_CLIENT_ID,
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use super::hooks::RelayHooks;
use super::storage::{TopicStorage, TopicStorageError};

const CONNECT_ATTEMPTS: usize = 3;

/// Errors that can occur connecting to a topic.
#[derive(Debug)]
pub enum RelayError {
    /// The topic id cannot be served.
    InvalidTopic(TopicStorageError),
    /// The topic's actor kept shutting down while connecting.
    Unavailable(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::InvalidTopic(e) => write!(f, "{}", e),
            RelayError::Unavailable(topic) => write!(f, "Topic unavailable: {}", topic),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::InvalidTopic(e) => Some(e),
            RelayError::Unavailable(_) => None,
        }
    }
}

impl From<TopicStorageError> for RelayError {
    fn from(e: TopicStorageError) -> Self {
        RelayError::InvalidTopic(e)
    }
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Request timeout of each topic's server replica.
    pub request_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
        }
    }
}

enum Command {
    Connect {
        client_id: String,
        outbound: mpsc::UnboundedSender<String>,
        accepted: oneshot::Sender<u64>,
    },
    Message {
        from: String,
        payload: String,
    },
    Disconnect {
        client_id: String,
        serial: u64,
    },
    ClientIds {
        reply: oneshot::Sender<Vec<String>>,
    },
}

struct TopicHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
}

/// Routes clients to per-topic actors.
pub struct RelayHub {
    storage: TopicStorage,
    hooks: Arc<dyn RelayHooks>,
    options: RelayOptions,
    scheduler: Arc<Scheduler>,
    topics: RwLock<HashMap<String, TopicHandle>>,
    generations: AtomicU64,
}

impl RelayHub {
    pub fn new(storage: TopicStorage, hooks: Arc<dyn RelayHooks>, options: RelayOptions) -> Arc<Self> {
        Arc::new(Self {
            storage,
            hooks,
            options,
            scheduler: Scheduler::new(),
            topics: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(0),
        })
    }

    /// Connects a client to a topic, starting the topic's actor if needed.
    pub async fn connect(self: &Arc<Self>, topic: &str, client_id: &str) -> Result<ClientConnection, RelayError> {
        TopicStorage::validate_topic(topic)?;

        for _ in 0..CONNECT_ATTEMPTS {
            let (generation, commands) = self.topic(topic).await?;
            let (outbound, inbound) = mpsc::unbounded_channel();
            let (accepted, accept) = oneshot::channel();
            let sent = commands.send(Command::Connect {
                client_id: client_id.to_string(),
                outbound,
                accepted,
            });
            if sent.is_err() {
                self.remove_topic(topic, generation).await;
                continue;
            }
            if let Ok(serial) = accept.await {
                return Ok(ClientConnection {
                    topic: topic.to_string(),
                    client_id: client_id.to_string(),
                    serial,
                    commands,
                    inbound,
                });
            }
            // The actor was shutting down; drop its handle and start over.
            self.remove_topic(topic, generation).await;
        }
        Err(RelayError::Unavailable(topic.to_string()))
    }

    async fn topic(self: &Arc<Self>, topic: &str) -> Result<(u64, mpsc::UnboundedSender<Command>), RelayError> {
        if let Some(handle) = self.topics.read().await.get(topic) {
            return Ok((handle.generation, handle.commands.clone()));
        }

        let mut topics = self.topics.write().await;
        if let Some(handle) = topics.get(topic) {
            return Ok((handle.generation, handle.commands.clone()));
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (commands, receiver) = mpsc::unbounded_channel();
        let storage = self.storage.open(topic)?;

        // Commands queue in the channel while the actor loads its replica.
        let hub = Arc::downgrade(self);
        let hooks = self.hooks.clone();
        let options = self.options.clone();
        let scheduler = self.scheduler.clone();
        let name = topic.to_string();
        tokio::spawn(async move {
            let actor = TopicActor::start(name, storage, hooks, &options, scheduler).await;
            actor.run(receiver, hub, generation).await;
        });
        topics.insert(
            topic.to_string(),
            TopicHandle {
                generation,
                commands: commands.clone(),
            },
        );
        Ok((generation, commands))
    }

    async fn remove_topic(&self, topic: &str, generation: u64) {
        let mut topics = self.topics.write().await;
        if topics.get(topic).is_some_and(|handle| handle.generation == generation) {
            topics.remove(topic);
        }
    }

    /// Topics with a running actor.
    pub async fn topic_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.topics.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Clients connected to a topic, sorted.
    pub async fn client_ids(&self, topic: &str) -> Vec<String> {
        let commands = match self.topics.read().await.get(topic) {
            Some(handle) => handle.commands.clone(),
            None => return Vec::new(),
        };
        let (reply, ids) = oneshot::channel();
        if commands.send(Command::ClientIds { reply }).is_err() {
            return Vec::new();
        }
        ids.await.unwrap_or_default()
    }
}

/// One client's link to a topic. Dropping it disconnects the client.
pub struct ClientConnection {
    topic: String,
    client_id: String,
    serial: u64,
    commands: mpsc::UnboundedSender<Command>,
    inbound: mpsc::UnboundedReceiver<String>,
}

impl ClientConnection {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Hands an addressed payload (`to\npacket`) to the relay.
    pub fn send(&self, payload: impl Into<String>) -> bool {
        self.commands
            .send(Command::Message {
                from: self.client_id.clone(),
                payload: payload.into(),
            })
            .is_ok()
    }

    /// The next payload for this client, prefixed with its sender's id.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Disconnect {
            client_id: self.client_id.clone(),
            serial: self.serial,
        });
    }
}

/// The embedded server replica of a topic.
struct Replica {
    synchronizer: Synchronizer,
    persister: KeyValuePersister,
    deliver: mpsc::UnboundedSender<String>,
}

/// Open connections by client id, then by connection serial. A client id can
/// hold several sockets; each gets everything addressed to that id.
type Clients = HashMap<String, HashMap<u64, mpsc::UnboundedSender<String>>>;

struct TopicActor {
    topic: String,
    hooks: Arc<dyn RelayHooks>,
    clients: Clients,
    next_serial: u64,
    replica: Replica,
    replica_sent: mpsc::UnboundedReceiver<String>,
}

impl TopicActor {
    /// Loads the topic's replica from storage and starts syncing it.
    async fn start(
        topic: String,
        storage: Arc<FileStorage>,
        hooks: Arc<dyn RelayHooks>,
        options: &RelayOptions,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let store = SharedStore::new(MergeableStore::new(Some(SERVER_CLIENT_ID)));
        let persister =
            create_key_value_persister(store.clone(), storage, "", scheduler.clone(), log_ignored_error());
        persister.load(None).await;
        persister.start_auto_save().await;

        let (transport, handle) = channel();
        let synchronizer = Synchronizer::new(
            store,
            transport,
            SynchronizerOptions {
                request_timeout: options.request_timeout,
                ..SynchronizerOptions::default()
            },
            scheduler,
        );
        let syncing = synchronizer.clone();
        tokio::spawn(async move { syncing.start_sync(None).await });
        debug!(topic, "Server replica started");

        Self {
            topic,
            hooks,
            clients: HashMap::new(),
            next_serial: 0,
            replica: Replica {
                synchronizer,
                persister,
                deliver: handle.deliver,
            },
            replica_sent: handle.sent,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, hub: Weak<RelayHub>, generation: u64) {
        loop {
            let command = tokio::select! {
                Some(payload) = self.replica_sent.recv() => {
                    self.route(SERVER_CLIENT_ID, &payload);
                    continue;
                }
                command = commands.recv() => command,
            };
            let Some(command) = command else {
                break;
            };

            match command {
                Command::Connect {
                    client_id,
                    outbound,
                    accepted,
                } => self.connect(client_id, outbound, accepted),
                Command::Message { from, payload } => self.route(&from, &payload),
                Command::ClientIds { reply } => {
                    let mut ids: Vec<String> = self.clients.keys().cloned().collect();
                    ids.sort();
                    let _ = reply.send(ids);
                }
                Command::Disconnect { client_id, serial } => {
                    if self.disconnect(&client_id, serial).await && commands.is_empty() {
                        break;
                    }
                }
            }
        }

        // Refuse new work; queued connects are dropped and retried by the hub.
        commands.close();
        while commands.try_recv().is_ok() {}
        self.replica.synchronizer.destroy();
        self.replica.persister.destroy();
        if let Some(hub) = hub.upgrade() {
            hub.remove_topic(&self.topic, generation).await;
        }
        debug!(topic = %self.topic, "Topic actor stopped");
    }

    fn connect(&mut self, client_id: String, outbound: mpsc::UnboundedSender<String>, accepted: oneshot::Sender<u64>) {
        let serial = self.next_serial;
        self.next_serial += 1;
        if accepted.send(serial).is_err() {
            return;
        }
        if self.clients.is_empty() {
            self.hooks.on_topic_activated(&self.topic);
        }
        self.hooks.on_client_presence_changed(&self.topic, &client_id, 1);

        // Greet on behalf of the server replica so a syncing client reconciles
        // with it right away.
        let hashes = self
            .replica
            .synchronizer
            .store()
            .with(|store| store.get_mergeable_content_hashes());
        match create_payload(Some(SERVER_CLIENT_ID), None, MessageKind::AnnounceContentHashes, &hashes) {
            Ok(greeting) => {
                let _ = outbound.send(greeting);
            }
            Err(e) => warn!(error = %e, "Failed to encode greeting"),
        }
        self.clients.entry(client_id).or_default().insert(serial, outbound);
    }

    /// Removes one connection. Returns whether the topic is now idle.
    async fn disconnect(&mut self, client_id: &str, serial: u64) -> bool {
        let Some(connections) = self.clients.get_mut(client_id) else {
            return false;
        };
        if connections.remove(&serial).is_none() {
            return false;
        }
        if connections.is_empty() {
            self.clients.remove(client_id);
        }
        self.hooks.on_client_presence_changed(&self.topic, client_id, -1);
        if !self.clients.is_empty() {
            return false;
        }
        self.hooks.on_topic_deactivated(&self.topic);
        self.replica.persister.save(None).await;
        true
    }

    fn route(&mut self, from: &str, payload: &str) {
        let Some((to, remainder)) = split_payload(payload) else {
            debug!(topic = %self.topic, from, "Dropping payload without separator");
            return;
        };
        let forwarded = create_raw_payload(from, remainder);
        if receive_payload(&forwarded).is_err() {
            debug!(topic = %self.topic, from, "Dropping malformed payload");
            return;
        }
        self.hooks.on_message(&self.topic, from, to, remainder);

        if to.is_empty() {
            if from != SERVER_CLIENT_ID {
                let _ = self.replica.deliver.send(forwarded.clone());
            }
            for (client_id, connections) in &self.clients {
                if client_id != from {
                    for connection in connections.values() {
                        let _ = connection.send(forwarded.clone());
                    }
                }
            }
        } else if to == SERVER_CLIENT_ID {
            if from != SERVER_CLIENT_ID {
                let _ = self.replica.deliver.send(forwarded);
            }
        } else if to != from {
            if let Some(connections) = self.clients.get(to) {
                for connection in connections.values() {
                    let _ = connection.send(forwarded.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::hooks::RelayHooks;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<String>>,
    }

    impl RelayHooks for RecordingHooks {
        fn on_topic_activated(&self, topic: &str) {
            self.events.lock().unwrap().push(format!("activated {topic}"));
        }

        fn on_topic_deactivated(&self, topic: &str) {
            self.events.lock().unwrap().push(format!("deactivated {topic}"));
        }

        fn on_client_presence_changed(&self, topic: &str, client_id: &str, delta: i8) {
            self.events.lock().unwrap().push(format!("{topic} {client_id} {delta:+}"));
        }
    }

    fn hub(hooks: Arc<RecordingHooks>) -> (Arc<RelayHub>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let options = RelayOptions {
            request_timeout: Duration::from_millis(100),
        };
        (RelayHub::new(TopicStorage::new(temp_dir.path()), hooks, options), temp_dir)
    }

    async fn next_from(connection: &mut ClientConnection, from: &str) -> Option<String> {
        let prefix = format!("{from}\n");
        tokio::time::timeout(Duration::from_millis(300), async {
            loop {
                let payload = connection.recv().await?;
                if payload.starts_with(&prefix) {
                    return Some(payload);
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    #[tokio::test]
    async fn test_greets_new_clients_for_the_replica() {
        let (hub, _temp) = hub(Arc::default());
        let mut client = hub.connect("pets", "c1").await.unwrap();
        let greeting = client.recv().await.unwrap();
        assert_eq!(greeting, "S\n[null,2,[0,0]]");
    }

    #[tokio::test]
    async fn test_unicast_reaches_only_the_named_client() {
        let (hub, _temp) = hub(Arc::default());
        let c1 = hub.connect("pets", "c1").await.unwrap();
        let mut c2 = hub.connect("pets", "c2").await.unwrap();
        let mut c3 = hub.connect("pets", "c3").await.unwrap();

        assert!(c1.send("c2\n[\"tx\",0,{}]"));
        assert_eq!(next_from(&mut c2, "c1").await.as_deref(), Some("c1\n[\"tx\",0,{}]"));
        assert_eq!(next_from(&mut c3, "c1").await, None);
    }

    #[tokio::test]
    async fn test_malformed_payloads_are_dropped() {
        let (hub, _temp) = hub(Arc::default());
        let c1 = hub.connect("pets", "c1").await.unwrap();
        let mut c2 = hub.connect("pets", "c2").await.unwrap();

        assert!(c1.send("no separator"));
        assert!(c1.send("\nnot json"));
        assert!(c1.send("\n[null,3,[[{}],[{}]]]"));
        let forwarded = next_from(&mut c2, "c1").await.unwrap();
        assert_eq!(forwarded, "c1\n[null,3,[[{}],[{}]]]");
    }

    #[tokio::test]
    async fn test_presence_hooks_and_eviction() {
        let hooks = Arc::new(RecordingHooks::default());
        let (hub, _temp) = hub(hooks.clone());

        let c1 = hub.connect("pets", "c1").await.unwrap();
        let c2 = hub.connect("pets", "c2").await.unwrap();
        assert_eq!(hub.client_ids("pets").await, vec!["c1", "c2"]);
        assert_eq!(hub.topic_ids().await, vec!["pets"]);

        drop(c1);
        drop(c2);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !hub.topic_ids().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *hooks.events.lock().unwrap(),
            vec![
                "activated pets",
                "pets c1 +1",
                "pets c2 +1",
                "pets c1 -1",
                "pets c2 -1",
                "deactivated pets",
            ]
        );

        // A new connection starts a fresh actor.
        let _c3 = hub.connect("pets", "c3").await.unwrap();
        assert_eq!(hub.client_ids("pets").await, vec!["c3"]);
    }

    #[tokio::test]
    async fn test_duplicate_client_ids_keep_separate_connections() {
        let hooks = Arc::new(RecordingHooks::default());
        let (hub, _temp) = hub(hooks.clone());

        let stale = hub.connect("pets", "dup").await.unwrap();
        let mut live = hub.connect("pets", "dup").await.unwrap();
        let other = hub.connect("pets", "other").await.unwrap();
        drop(stale);

        assert_eq!(hub.client_ids("pets").await, vec!["dup", "other"]);
        assert!(other.send("dup\n[\"tx\",0,{}]"));
        assert_eq!(next_from(&mut live, "other").await.as_deref(), Some("other\n[\"tx\",0,{}]"));

        assert_eq!(
            *hooks.events.lock().unwrap(),
            vec!["activated pets", "pets dup +1", "pets dup +1", "pets other +1", "pets dup -1"]
        );
    }

    #[tokio::test]
    async fn test_topics_start_without_blocking_the_hub() {
        let (hub, _temp) = hub(Arc::default());

        let (pets, plants) = tokio::join!(hub.connect("pets", "c1"), hub.connect("plants", "c1"));
        let (mut pets, mut plants) = (pets.unwrap(), plants.unwrap());
        assert_eq!(hub.topic_ids().await, vec!["pets", "plants"]);
        assert_eq!(pets.recv().await.as_deref(), Some("S\n[null,2,[0,0]]"));
        assert_eq!(plants.recv().await.as_deref(), Some("S\n[null,2,[0,0]]"));

        // Listing topics does not wait for a starting actor.
        let starting = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.connect("birds", "c1").await })
        };
        tokio::time::timeout(Duration::from_millis(500), hub.topic_ids())
            .await
            .unwrap();
        assert!(starting.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_topic_is_rejected() {
        let (hub, _temp) = hub(Arc::default());
        assert!(matches!(
            hub.connect("../etc", "c1").await,
            Err(RelayError::InvalidTopic(_))
        ));
    }
}

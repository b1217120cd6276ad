//! Table instance
//!
//! An [`Instance`] owns the shared state of one table: topic registry, value
//! store, subscription engine and client manager. Connection workers and
//! local clients hold it as `Arc<Instance>`; every operation below is
//! synchronous and never awaits.
//!
//! Registry mutations return [`TopicEvent`]s, which the instance hands to
//! the subscription engine before returning, so subscribers always see a
//! topic's announcement before any of its values.

pub mod config;
pub mod local;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::meta;
use crate::registry::{PublisherKey, RegistryError, TopicEvent, TopicInfo, TopicRegistry};
use crate::session::{ClientId, ClientInfo, ClientManager};
use crate::storage::{now_micros, SetOutcome, ValueStore};
use crate::subscription::{DeliverySender, SubscriberEntry, SubscriberOptions, SubscriptionEngine};
use crate::value::{Properties, PropertyUpdate, TimestampedValue, Value, ValueType};

pub use config::InstanceConfig;
pub use local::{ConnectionListener, EventKinds, Listener, LocalClient, Publisher, Subscriber};

/// Client id owning the metadata publishers
const META_CLIENT: ClientId = 0;

/// A client connected or disconnected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(ClientInfo),
    Disconnected(ClientInfo),
}

impl ConnectionEvent {
    pub fn info(&self) -> &ClientInfo {
        match self {
            ConnectionEvent::Connected(info) | ConnectionEvent::Disconnected(info) => info,
        }
    }
}

pub struct Instance {
    config: InstanceConfig,
    registry: TopicRegistry,
    store: ValueStore,
    engine: SubscriptionEngine,
    clients: ClientManager,

    connection_sinks: RwLock<HashMap<u64, mpsc::UnboundedSender<ConnectionEvent>>>,
    next_sink_id: AtomicU64,

    /// Metadata topic name → internal pubuid
    meta_publishers: Mutex<HashMap<String, u32>>,
    next_meta_uid: AtomicU32,
}

impl Instance {
    pub fn new(config: InstanceConfig) -> Self {
        tracing::debug!(
            name = %config.server_name,
            meta_topics = config.meta_topics,
            "Instance created"
        );

        Self {
            config,
            registry: TopicRegistry::new(),
            store: ValueStore::new(),
            engine: SubscriptionEngine::new(),
            clients: ClientManager::new(),
            connection_sinks: RwLock::new(HashMap::new()),
            next_sink_id: AtomicU64::new(1),
            meta_publishers: Mutex::new(HashMap::new()),
            next_meta_uid: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    pub fn engine(&self) -> &SubscriptionEngine {
        &self.engine
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    // ========================================================================
    // Clients
    // ========================================================================

    /// Register a new client and return its identity
    pub fn connect(&self, name: &str, peer: Option<SocketAddr>, version: u16) -> ClientInfo {
        let info = ClientInfo::new(self.clients.next_id(), name, peer, version);
        self.attach(info.clone());
        info
    }

    /// Register a client whose id was allocated beforehand
    pub fn attach(&self, info: ClientInfo) {
        self.clients.on_connect(info.clone());
        self.notify_connection(ConnectionEvent::Connected(info));
        self.refresh_clients_meta();
    }

    /// Remove a client and release all of its publishers and subscribers
    ///
    /// Topics whose last publisher this was are unannounced. Deliveries
    /// already enqueued elsewhere are not retracted.
    pub fn disconnect(&self, id: ClientId) -> Result<ClientInfo, RegistryError> {
        let record = self.clients.on_disconnect(id)?;

        for subscriber in record.subscribers.values() {
            if let Ok(entry) = self.engine.unsubscribe(*subscriber) {
                self.refresh_matched_subs_meta(&entry);
            }
        }

        for (pubuid, topic_id) in &record.publishers {
            let name = self.registry.lookup_id(*topic_id).ok().map(|t| t.name);
            match self.registry.remove(&PublisherKey::new(id, *pubuid)) {
                Ok(event) => {
                    let removed = event.is_some();
                    self.dispatch(event.into_iter().collect());
                    if let (false, Some(name)) = (removed, name) {
                        self.refresh_topic_pubs_meta(&name);
                    }
                }
                Err(e) => {
                    tracing::debug!(client_id = id, pubuid = *pubuid, error = %e, "Publisher already released");
                }
            }
        }

        self.drop_meta(&meta::client_pub_topic(id));
        self.drop_meta(&meta::client_sub_topic(id));

        self.notify_connection(ConnectionEvent::Disconnected(record.info.clone()));
        self.refresh_clients_meta();

        Ok(record.info)
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Start publishing a topic under a client's pubuid
    ///
    /// Creates the topic if needed. Fails with `TypeMismatch` if the topic
    /// exists with another type.
    pub fn publish(
        &self,
        client: ClientId,
        pubuid: u32,
        name: &str,
        value_type: ValueType,
        properties: &Properties,
    ) -> Result<TopicInfo, RegistryError> {
        if !self.clients.contains(client) {
            return Err(RegistryError::ClientNotFound(client));
        }

        let key = PublisherKey::new(client, pubuid);
        let announcement = self.registry.announce(key, name, value_type, properties)?;
        self.dispatch(announcement.events());

        if let Err(e) = self.clients.add_publisher(client, pubuid, announcement.topic.id) {
            // Client disconnected meanwhile
            if let Ok(event) = self.registry.remove(&key) {
                self.dispatch(event.into_iter().collect());
            }
            return Err(e);
        }

        tracing::debug!(
            client_id = client,
            pubuid = pubuid,
            topic = %name,
            id = announcement.topic.id,
            "Publish"
        );

        self.refresh_client_pubs_meta(client);
        self.refresh_topic_pubs_meta(name);

        Ok(announcement.topic)
    }

    /// Stop publishing
    pub fn unpublish(&self, client: ClientId, pubuid: u32) -> Result<(), RegistryError> {
        let key = PublisherKey::new(client, pubuid);
        let name = self
            .registry
            .topic_of(&key)
            .and_then(|id| self.registry.lookup_id(id).ok())
            .map(|t| t.name);

        let event = self.registry.remove(&key)?;
        self.clients.remove_publisher(client, pubuid);

        let removed = event.is_some();
        self.dispatch(event.into_iter().collect());

        tracing::debug!(client_id = client, pubuid = pubuid, "Unpublish");

        self.refresh_client_pubs_meta(client);
        if let (false, Some(name)) = (removed, name) {
            self.refresh_topic_pubs_meta(&name);
        }
        Ok(())
    }

    /// Write a value through a publisher
    ///
    /// A `timestamp` of 0 means "now" on the server clock.
    pub fn set_value(
        &self,
        client: ClientId,
        pubuid: u32,
        value: Value,
        timestamp: i64,
    ) -> Result<SetOutcome, RegistryError> {
        let topic_id = self
            .clients
            .publisher_topic(client, pubuid)
            .ok_or(RegistryError::PublisherNotFound { client, pubuid })?;
        let topic = self.registry.lookup_id(topic_id)?;
        self.store_value(&topic, value, timestamp)
    }

    fn store_value(
        &self,
        topic: &TopicInfo,
        value: Value,
        timestamp: i64,
    ) -> Result<SetOutcome, RegistryError> {
        let timestamp = if timestamp == 0 { now_micros() } else { timestamp };
        let outcome = self.store.update(topic, value, timestamp, |stored| {
            self.engine.on_value(topic.id, &topic.name, stored, Instant::now());
        })?;

        // Deleted while the value was in flight; its cell is already gone
        if self.registry.lookup_id(topic.id).is_err() {
            self.store.remove(topic.id);
        }
        Ok(outcome)
    }

    /// Apply a partial property update (`None` deletes a key)
    pub fn set_properties(&self, name: &str, update: &PropertyUpdate) -> Result<(), RegistryError> {
        let events = self.registry.set_properties(name, update)?;
        self.dispatch(events);
        Ok(())
    }

    // ========================================================================
    // Subscribing
    // ========================================================================

    /// Register a subscriber for a client
    ///
    /// Reusing a subuid replaces the previous subscriber. Matching topics are
    /// announced into `sink`; with `send_all` their stored values follow.
    pub fn subscribe(
        &self,
        client: ClientId,
        subuid: u32,
        patterns: &[String],
        options: SubscriberOptions,
        sink: DeliverySender,
    ) -> Result<Arc<SubscriberEntry>, RegistryError> {
        if !self.clients.contains(client) {
            return Err(RegistryError::ClientNotFound(client));
        }
        if self.clients.subscriber(client, subuid).is_some() {
            self.unsubscribe(client, subuid)?;
        }

        let entry = self.engine.subscribe(client, subuid, patterns, options, sink);
        if let Err(e) = self.clients.add_subscriber(client, subuid, entry.id) {
            let _ = self.engine.unsubscribe(entry.id);
            return Err(e);
        }

        let send_values = entry.options.send_all && !entry.options.topics_only;
        for topic in self.registry.topics() {
            if !entry.matches(&topic.name) {
                continue;
            }
            if entry.match_topic(&topic) && self.registry.lookup_id(topic.id).is_err() {
                // Deleted between the snapshot and the match
                entry.unmatch_topic(topic.id, &topic.name);
                continue;
            }
            if send_values {
                self.store.read_with(topic.id, |value| {
                    if let Some(value) = value {
                        entry.offer(topic.id, &topic.name, value, Instant::now());
                    }
                });
            }
            self.refresh_topic_subs_meta(&topic);
        }

        self.refresh_client_subs_meta(client);
        Ok(entry)
    }

    /// Remove a client's subscriber
    pub fn unsubscribe(&self, client: ClientId, subuid: u32) -> Result<(), RegistryError> {
        let id = self
            .clients
            .remove_subscriber(client, subuid)
            .ok_or(RegistryError::SubscriberNotFound(subuid as u64))?;
        let entry = self.engine.unsubscribe(id)?;

        self.refresh_matched_subs_meta(&entry);
        self.refresh_client_subs_meta(client);
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Latest value of a topic
    pub fn get_value(&self, name: &str) -> Option<TimestampedValue> {
        let topic = self.registry.lookup(name).ok()?;
        self.store.get(topic.id)
    }

    pub fn topic(&self, name: &str) -> Result<TopicInfo, RegistryError> {
        self.registry.lookup(name)
    }

    /// Snapshot of all topics, by id
    pub fn topics(&self) -> Vec<TopicInfo> {
        self.registry.topics()
    }

    /// Deliver rate-limited values that are due
    pub fn flush_due(&self, now: Instant) -> usize {
        self.engine.flush_due(now)
    }

    // ========================================================================
    // Connection listeners
    // ========================================================================

    /// Register a connection event sink
    ///
    /// With `immediate`, a `Connected` event for every current client is
    /// sent first.
    pub fn add_connection_sink(
        &self,
        sink: mpsc::UnboundedSender<ConnectionEvent>,
        immediate: bool,
    ) -> u64 {
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        if immediate {
            for info in self.clients.clients() {
                let _ = sink.send(ConnectionEvent::Connected(info));
            }
        }
        self.connection_sinks.write().insert(id, sink);
        id
    }

    pub fn remove_connection_sink(&self, id: u64) -> bool {
        self.connection_sinks.write().remove(&id).is_some()
    }

    fn notify_connection(&self, event: ConnectionEvent) {
        for sink in self.connection_sinks.read().values() {
            let _ = sink.send(event.clone());
        }
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    fn dispatch(&self, events: Vec<TopicEvent>) {
        for event in events {
            let delivered = self.engine.on_topic_event(&event);
            tracing::trace!(
                id = event.topic_id(),
                topic = %event.topic_name(),
                delivered = delivered,
                "Topic event dispatched"
            );

            match &event {
                TopicEvent::Announced(topic) => {
                    // A value may already exist if another publisher wrote
                    // before this announcement reached the engine
                    self.store.read_with(topic.id, |value| {
                        if let Some(value) = value {
                            self.engine.on_value(topic.id, &topic.name, value, Instant::now());
                        }
                    });
                    self.refresh_topic_pubs_meta(&topic.name);
                    self.refresh_topic_subs_meta(topic);
                }
                TopicEvent::Unannounced { id, name } => {
                    self.store.remove(*id);
                    self.drop_meta(&meta::topic_pub_topic(name));
                    self.drop_meta(&meta::topic_sub_topic(name));
                }
                TopicEvent::PropertiesChanged { .. } => {}
            }
        }
    }

    // ========================================================================
    // Metadata topics
    // ========================================================================

    fn meta_applies(&self, topic: &str) -> bool {
        self.config.meta_topics && !topic.starts_with(crate::subscription::pattern::META_PREFIX)
    }

    fn write_meta(&self, name: &str, data: Vec<u8>) {
        let pubuid = *self
            .meta_publishers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| self.next_meta_uid.fetch_add(1, Ordering::Relaxed));

        let key = PublisherKey::new(META_CLIENT, pubuid);
        let topic = match self.registry.announce(key, name, ValueType::Raw, &Properties::new()) {
            Ok(announcement) => {
                self.dispatch(announcement.events());
                announcement.topic
            }
            Err(e) => {
                tracing::warn!(topic = %name, error = %e, "Metadata topic unavailable");
                return;
            }
        };

        if let Err(e) = self.store_value(&topic, Value::Raw(data), 0) {
            tracing::warn!(topic = %name, error = %e, "Metadata update failed");
        }
    }

    fn drop_meta(&self, name: &str) {
        let Some(pubuid) = self.meta_publishers.lock().remove(name) else {
            return;
        };
        if let Ok(Some(event)) = self.registry.remove(&PublisherKey::new(META_CLIENT, pubuid)) {
            self.dispatch(vec![event]);
        }
    }

    fn refresh_clients_meta(&self) {
        if !self.config.meta_topics {
            return;
        }
        let clients: Vec<meta::ClientMeta> = self
            .clients
            .clients()
            .into_iter()
            .map(|info| meta::ClientMeta {
                peer: info.peer_string(),
                id: info.id,
                name: info.name,
                version: info.version,
            })
            .collect();
        self.write_meta(meta::CLIENTS_TOPIC, meta::encode_clients(&clients));
    }

    fn refresh_client_pubs_meta(&self, client: ClientId) {
        if !self.config.meta_topics {
            return;
        }
        let Some(record) = self.clients.get(client) else {
            return;
        };
        let publishers: Vec<meta::ClientPublisher> = record
            .publishers
            .iter()
            .filter_map(|(uid, topic_id)| {
                let topic = self.registry.lookup_id(*topic_id).ok()?;
                Some(meta::ClientPublisher {
                    uid: *uid,
                    topic: topic.name.to_string(),
                })
            })
            .collect();
        self.write_meta(
            &meta::client_pub_topic(client),
            meta::encode_client_publishers(&publishers),
        );
    }

    fn refresh_client_subs_meta(&self, client: ClientId) {
        if !self.config.meta_topics || !self.clients.contains(client) {
            return;
        }
        let subscribers: Vec<meta::ClientSubscriber> = self
            .engine
            .subscribers_of(client)
            .iter()
            .map(|entry| meta::ClientSubscriber {
                uid: entry.uid,
                topics: entry.pattern_strings(),
                options: entry.options.clone(),
            })
            .collect();
        self.write_meta(
            &meta::client_sub_topic(client),
            meta::encode_client_subscribers(&subscribers),
        );
    }

    fn refresh_topic_pubs_meta(&self, name: &str) {
        if !self.meta_applies(name) {
            return;
        }
        let Ok(publishers) = self.registry.publishers(name) else {
            return;
        };
        let publishers: Vec<meta::TopicPublisher> = publishers
            .into_iter()
            .map(|key| meta::TopicPublisher {
                client: key.client,
                pubuid: key.pubuid,
            })
            .collect();
        self.write_meta(
            &meta::topic_pub_topic(name),
            meta::encode_topic_publishers(&publishers),
        );
    }

    fn refresh_topic_subs_meta(&self, topic: &TopicInfo) {
        if !self.meta_applies(&topic.name) {
            return;
        }
        let subscribers: Vec<meta::TopicSubscriber> = self
            .engine
            .subscribers_matching(topic.id)
            .iter()
            .map(|entry| meta::TopicSubscriber {
                client: entry.owner,
                subuid: entry.uid,
                options: entry.options.clone(),
            })
            .collect();
        self.write_meta(
            &meta::topic_sub_topic(&topic.name),
            meta::encode_topic_subscribers(&subscribers),
        );
    }

    fn refresh_matched_subs_meta(&self, entry: &SubscriberEntry) {
        if !self.config.meta_topics {
            return;
        }
        for id in entry.matched_topics() {
            if let Ok(topic) = self.registry.lookup_id(id) {
                self.refresh_topic_subs_meta(&topic);
            }
        }
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new(InstanceConfig::default())
    }
}

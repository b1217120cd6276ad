//! Client manager
//!
//! Book-keeping of connected clients and the publishers and subscribers
//! each one owns. Releasing those on disconnect is done by the instance,
//! which gets the full record back from [`ClientManager::on_disconnect`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::registry::{RegistryError, TopicId};
use crate::subscription::SubscriberId;

use super::context::{ClientId, ClientInfo};

/// Everything known about one client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub info: ClientInfo,
    /// pubuid → topic
    pub publishers: BTreeMap<u32, TopicId>,
    /// subuid → engine subscriber
    pub subscribers: BTreeMap<u32, SubscriberId>,
}

pub struct ClientManager {
    clients: RwLock<HashMap<ClientId, ClientRecord>>,
    next_id: AtomicU64,
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a client ID ahead of registration
    pub fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a client whose handshake completed
    pub fn on_connect(&self, info: ClientInfo) {
        tracing::info!(
            client_id = info.id,
            name = %info.name,
            peer = %info.peer_string(),
            version = info.version,
            "Client connected"
        );

        self.clients.write().insert(
            info.id,
            ClientRecord {
                info,
                publishers: BTreeMap::new(),
                subscribers: BTreeMap::new(),
            },
        );
    }

    /// Remove a client, returning its record for cleanup
    pub fn on_disconnect(&self, id: ClientId) -> Result<ClientRecord, RegistryError> {
        let record = self
            .clients
            .write()
            .remove(&id)
            .ok_or(RegistryError::ClientNotFound(id))?;

        tracing::info!(
            client_id = id,
            name = %record.info.name,
            publishers = record.publishers.len(),
            subscribers = record.subscribers.len(),
            duration_secs = record.info.connected_at.elapsed().as_secs(),
            "Client disconnected"
        );

        Ok(record)
    }

    /// Bind a pubuid to a topic
    ///
    /// Returns the topic previously bound to the same pubuid, if any.
    pub fn add_publisher(
        &self,
        id: ClientId,
        pubuid: u32,
        topic: TopicId,
    ) -> Result<Option<TopicId>, RegistryError> {
        let mut clients = self.clients.write();
        let record = clients.get_mut(&id).ok_or(RegistryError::ClientNotFound(id))?;
        Ok(record.publishers.insert(pubuid, topic))
    }

    pub fn remove_publisher(&self, id: ClientId, pubuid: u32) -> Option<TopicId> {
        self.clients
            .write()
            .get_mut(&id)
            .and_then(|record| record.publishers.remove(&pubuid))
    }

    pub fn add_subscriber(
        &self,
        id: ClientId,
        subuid: u32,
        subscriber: SubscriberId,
    ) -> Result<Option<SubscriberId>, RegistryError> {
        let mut clients = self.clients.write();
        let record = clients.get_mut(&id).ok_or(RegistryError::ClientNotFound(id))?;
        Ok(record.subscribers.insert(subuid, subscriber))
    }

    pub fn remove_subscriber(&self, id: ClientId, subuid: u32) -> Option<SubscriberId> {
        self.clients
            .write()
            .get_mut(&id)
            .and_then(|record| record.subscribers.remove(&subuid))
    }

    /// Topic bound to a pubuid
    pub fn publisher_topic(&self, id: ClientId, pubuid: u32) -> Option<TopicId> {
        self.clients
            .read()
            .get(&id)
            .and_then(|record| record.publishers.get(&pubuid).copied())
    }

    pub fn subscriber(&self, id: ClientId, subuid: u32) -> Option<SubscriberId> {
        self.clients
            .read()
            .get(&id)
            .and_then(|record| record.subscribers.get(&subuid).copied())
    }

    pub fn get(&self, id: ClientId) -> Option<ClientRecord> {
        self.clients.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.read().contains_key(&id)
    }

    /// All connected clients, by id
    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .clients
            .read()
            .values()
            .map(|record| record.info.clone())
            .collect();
        clients.sort_by_key(|info| info.id);
        clients
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(manager: &ClientManager, name: &str) -> ClientId {
        let id = manager.next_id();
        manager.on_connect(ClientInfo::new(id, name, None, 0x0401));
        id
    }

    #[test]
    fn test_connect_and_disconnect() {
        let manager = ClientManager::new();
        let a = connect(&manager, "a");
        let b = connect(&manager, "b");
        assert_ne!(a, b);
        assert_eq!(manager.len(), 2);

        let names: Vec<String> = manager.clients().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        let record = manager.on_disconnect(a).unwrap();
        assert_eq!(record.info.name, "a");
        assert!(!manager.contains(a));
        assert_eq!(manager.on_disconnect(a), Err(RegistryError::ClientNotFound(a)));
    }

    #[test]
    fn test_publisher_and_subscriber_bindings() {
        let manager = ClientManager::new();
        let id = connect(&manager, "c");

        assert_eq!(manager.add_publisher(id, 2, 10).unwrap(), None);
        assert_eq!(manager.add_publisher(id, 1, 11).unwrap(), None);
        assert_eq!(manager.publisher_topic(id, 2), Some(10));

        manager.add_subscriber(id, 5, 100).unwrap();
        assert_eq!(manager.subscriber(id, 5), Some(100));

        let record = manager.get(id).unwrap();
        let pubuids: Vec<u32> = record.publishers.keys().copied().collect();
        assert_eq!(pubuids, vec![1, 2]);

        assert_eq!(manager.remove_publisher(id, 2), Some(10));
        assert_eq!(manager.remove_publisher(id, 2), None);
        assert_eq!(manager.remove_subscriber(id, 5), Some(100));
    }

    #[test]
    fn test_unknown_client() {
        let manager = ClientManager::new();
        assert_eq!(
            manager.add_publisher(99, 1, 1),
            Err(RegistryError::ClientNotFound(99))
        );
        assert_eq!(manager.add_subscriber(99, 1, 1), Err(RegistryError::ClientNotFound(99)));
    }
}

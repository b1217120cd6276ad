//! Topic registry implementation
//!
//! The authoritative set of named, typed topics and the publishers bound to
//! them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::{Properties, PropertyUpdate, ValueType};

use super::entry::TopicEntry;
use super::error::RegistryError;
use super::event::TopicEvent;
use super::topic::{Announcement, PublisherKey, TopicId, TopicInfo};

/// Central registry for all topics
///
/// The name map is only write-locked to insert or delete a topic; all other
/// operations take its read lock and then lock the single topic they touch,
/// so unrelated topics never contend.
pub struct TopicRegistry {
    /// Map of topic name to topic entry
    topics: RwLock<HashMap<Arc<str>, Arc<RwLock<TopicEntry>>>>,

    /// Topic id to name index
    ids: RwLock<HashMap<TopicId, Arc<str>>>,

    /// Publisher handle to the topic it is bound to
    publishers: RwLock<HashMap<PublisherKey, TopicId>>,

    next_id: AtomicU32,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            ids: RwLock::new(HashMap::new()),
            publishers: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    fn entry(&self, name: &str) -> Option<Arc<RwLock<TopicEntry>>> {
        self.topics.read().get(name).cloned()
    }

    fn entry_by_id(&self, id: TopicId) -> Option<Arc<RwLock<TopicEntry>>> {
        let name = self.ids.read().get(&id).cloned()?;
        self.entry(&name)
    }

    /// Announce a publisher for a topic
    ///
    /// Creates the topic if it does not exist. Announcing again with the same
    /// publisher handle is a no-op apart from merging properties. Fails with
    /// `TypeMismatch` if the topic exists with a different declared type, and
    /// with `PublisherConflict` if the handle is already bound to another
    /// topic.
    pub fn announce(
        &self,
        publisher: PublisherKey,
        name: &str,
        value_type: ValueType,
        properties: &Properties,
    ) -> Result<Announcement, RegistryError> {
        let bound = self.publishers.read().get(&publisher).copied();
        if let Some(bound) = bound {
            let bound_name = self.ids.read().get(&bound).cloned();
            if bound_name.as_deref() != Some(name) {
                return Err(RegistryError::PublisherConflict {
                    client: publisher.client,
                    pubuid: publisher.pubuid,
                    topic: bound_name.map(|n| n.to_string()).unwrap_or_default(),
                });
            }
        }

        // Fast path: existing topic, only the entry itself is locked
        if let Some(entry_arc) = self.entry(name) {
            let mut entry = entry_arc.write();
            if !entry.removed {
                return self.attach(&mut entry, publisher, value_type, properties);
            }
        }

        // Slow path: create (or race with a concurrent create/remove)
        let mut topics = self.topics.write();
        if let Some(entry_arc) = topics.get(name).cloned() {
            let mut entry = entry_arc.write();
            return self.attach(&mut entry, publisher, value_type, properties);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = Arc::from(name);
        let mut entry = TopicEntry::new(id, Arc::clone(&name), value_type, properties.clone());
        entry.publishers.insert(publisher);
        let info = entry.info();

        topics.insert(Arc::clone(&name), Arc::new(RwLock::new(entry)));
        self.ids.write().insert(id, Arc::clone(&name));
        self.publishers.write().insert(publisher, id);

        tracing::info!(
            topic = %name,
            id = id,
            value_type = %value_type,
            publisher = %publisher,
            "Topic created"
        );

        Ok(Announcement {
            topic: info,
            created: true,
            properties_update: PropertyUpdate::new(),
        })
    }

    fn attach(
        &self,
        entry: &mut TopicEntry,
        publisher: PublisherKey,
        value_type: ValueType,
        properties: &Properties,
    ) -> Result<Announcement, RegistryError> {
        if entry.value_type != value_type {
            return Err(RegistryError::TypeMismatch {
                name: entry.name.to_string(),
                existing: entry.value_type,
                requested: value_type,
            });
        }

        if entry.publishers.insert(publisher) {
            self.publishers.write().insert(publisher, entry.id);
            tracing::debug!(
                topic = %entry.name,
                publisher = %publisher,
                publishers = entry.publisher_count(),
                "Publisher added"
            );
        }

        let properties_update = entry.properties.merge(properties);

        Ok(Announcement {
            topic: entry.info(),
            created: false,
            properties_update,
        })
    }

    /// Release a publisher
    ///
    /// Returns `Unannounced` if this was the last publisher of a topic that
    /// is neither retained nor persistent.
    pub fn remove(&self, publisher: &PublisherKey) -> Result<Option<TopicEvent>, RegistryError> {
        let id = self
            .publishers
            .write()
            .remove(publisher)
            .ok_or(RegistryError::PublisherNotFound {
                client: publisher.client,
                pubuid: publisher.pubuid,
            })?;

        let Some(entry_arc) = self.entry_by_id(id) else {
            return Ok(None);
        };

        let orphaned = {
            let mut entry = entry_arc.write();
            entry.publishers.remove(publisher);
            tracing::debug!(
                topic = %entry.name,
                publisher = %publisher,
                publishers = entry.publisher_count(),
                "Publisher removed"
            );
            entry.is_orphaned()
        };

        if orphaned {
            Ok(self.delete_if_orphaned(id))
        } else {
            Ok(None)
        }
    }

    /// Delete a topic if it is still orphaned once the name map is locked
    fn delete_if_orphaned(&self, id: TopicId) -> Option<TopicEvent> {
        let mut topics = self.topics.write();
        let name = self.ids.read().get(&id).cloned()?;
        let entry_arc = topics.get(&name).cloned()?;

        let mut entry = entry_arc.write();
        if entry.removed || !entry.is_orphaned() {
            return None;
        }

        entry.removed = true;
        topics.remove(&name);
        self.ids.write().remove(&id);

        tracing::info!(topic = %name, id = id, "Topic removed");

        Some(TopicEvent::Unannounced { id, name })
    }

    /// Apply a partial property update to a topic
    ///
    /// Clearing the retained/persistent flags of a topic without publishers
    /// deletes it.
    pub fn set_properties(
        &self,
        name: &str,
        update: &PropertyUpdate,
    ) -> Result<Vec<TopicEvent>, RegistryError> {
        let entry_arc = self
            .entry(name)
            .ok_or_else(|| RegistryError::TopicNotFound(name.to_string()))?;

        let (id, applied, info, orphaned) = {
            let mut entry = entry_arc.write();
            if entry.removed {
                return Err(RegistryError::TopicNotFound(name.to_string()));
            }
            let applied = entry.properties.apply(update);
            (entry.id, applied, entry.info(), entry.is_orphaned())
        };

        let mut events = Vec::new();
        if !applied.is_empty() {
            events.push(TopicEvent::PropertiesChanged {
                topic: info,
                update: applied,
            });
        }
        if orphaned {
            events.extend(self.delete_if_orphaned(id));
        }
        Ok(events)
    }

    /// Look up a topic by name
    pub fn lookup(&self, name: &str) -> Result<TopicInfo, RegistryError> {
        self.entry(name)
            .map(|entry| entry.read().info())
            .ok_or_else(|| RegistryError::TopicNotFound(name.to_string()))
    }

    /// Look up a topic by id
    pub fn lookup_id(&self, id: TopicId) -> Result<TopicInfo, RegistryError> {
        self.entry_by_id(id)
            .map(|entry| entry.read().info())
            .ok_or(RegistryError::TopicIdNotFound(id))
    }

    /// Topic a publisher handle is bound to
    pub fn topic_of(&self, publisher: &PublisherKey) -> Option<TopicId> {
        self.publishers.read().get(publisher).copied()
    }

    /// Publishers bound to a topic, in handle order
    pub fn publishers(&self, name: &str) -> Result<Vec<PublisherKey>, RegistryError> {
        self.entry(name)
            .map(|entry| entry.read().publishers.iter().copied().collect())
            .ok_or_else(|| RegistryError::TopicNotFound(name.to_string()))
    }

    /// Number of publishers bound to a topic (0 if it does not exist)
    pub fn publisher_count(&self, name: &str) -> usize {
        self.entry(name)
            .map(|entry| entry.read().publisher_count())
            .unwrap_or(0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topics.read().contains_key(name)
    }

    /// Snapshot of every topic, ordered by id
    pub fn topics(&self) -> Vec<TopicInfo> {
        let entries: Vec<_> = self.topics.read().values().cloned().collect();
        let mut topics: Vec<TopicInfo> = entries.iter().map(|e| e.read().info()).collect();
        topics.sort_by_key(|t| t.id);
        topics
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

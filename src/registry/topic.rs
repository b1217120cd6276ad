//! Topic identity types
//!
//! This module defines the keys used to identify topics and publishers, and
//! the snapshot type handed out to callers.

use std::sync::Arc;

use crate::session::ClientId;
use crate::value::{Properties, PropertyUpdate, ValueType};

use super::event::TopicEvent;

/// Server-assigned topic identifier, increasing in announcement order
pub type TopicId = u32;

/// Identifies one publish call: the owning client and its publisher uid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublisherKey {
    pub client: ClientId,
    pub pubuid: u32,
}

impl PublisherKey {
    pub fn new(client: ClientId, pubuid: u32) -> Self {
        Self { client, pubuid }
    }
}

impl std::fmt::Display for PublisherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.client, self.pubuid)
    }
}

/// Snapshot of a topic's identity and properties
///
/// Cheap to clone: the name is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicInfo {
    pub id: TopicId,
    pub name: Arc<str>,
    pub value_type: ValueType,
    pub properties: Properties,
}

/// Result of announcing a publisher
#[derive(Debug, Clone)]
pub struct Announcement {
    /// The topic as it stands after the announce
    pub topic: TopicInfo,
    /// Whether the topic was created by this announce
    pub created: bool,
    /// Properties that changed on an already existing topic
    pub properties_update: PropertyUpdate,
}

impl Announcement {
    /// Events subscribers need to see for this announce
    pub fn events(&self) -> Vec<TopicEvent> {
        if self.created {
            vec![TopicEvent::Announced(self.topic.clone())]
        } else if !self.properties_update.is_empty() {
            vec![TopicEvent::PropertiesChanged {
                topic: self.topic.clone(),
                update: self.properties_update.clone(),
            }]
        } else {
            Vec::new()
        }
    }
}

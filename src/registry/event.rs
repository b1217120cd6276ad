//! Registry change events

use std::sync::Arc;

use crate::value::PropertyUpdate;

use super::topic::{TopicId, TopicInfo};

/// A change to the set of topics or to a topic's properties
#[derive(Debug, Clone, PartialEq)]
pub enum TopicEvent {
    /// A topic was created
    Announced(TopicInfo),
    /// A topic was deleted
    Unannounced { id: TopicId, name: Arc<str> },
    /// A topic's properties changed
    PropertiesChanged {
        topic: TopicInfo,
        update: PropertyUpdate,
    },
}

impl TopicEvent {
    pub fn topic_id(&self) -> TopicId {
        match self {
            TopicEvent::Announced(topic) => topic.id,
            TopicEvent::Unannounced { id, .. } => *id,
            TopicEvent::PropertiesChanged { topic, .. } => topic.id,
        }
    }

    pub fn topic_name(&self) -> &str {
        match self {
            TopicEvent::Announced(topic) => &topic.name,
            TopicEvent::Unannounced { name, .. } => name,
            TopicEvent::PropertiesChanged { topic, .. } => &topic.name,
        }
    }
}

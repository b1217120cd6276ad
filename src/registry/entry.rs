//! Topic entry
//!
//! This module defines the per-topic state stored in the registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::value::{Properties, ValueType};

use super::topic::{PublisherKey, TopicId, TopicInfo};

/// Entry for a single topic in the registry
#[derive(Debug)]
pub struct TopicEntry {
    /// Assigned identifier
    pub id: TopicId,

    /// Unique topic name
    pub name: Arc<str>,

    /// Declared value type
    pub value_type: ValueType,

    /// Current properties
    pub properties: Properties,

    /// Publishers currently bound to this topic
    pub(super) publishers: BTreeSet<PublisherKey>,

    /// Set once the entry has been taken out of the registry map
    pub(super) removed: bool,

    /// When the topic was created
    pub created_at: Instant,
}

impl TopicEntry {
    pub(super) fn new(
        id: TopicId,
        name: Arc<str>,
        value_type: ValueType,
        properties: Properties,
    ) -> Self {
        Self {
            id,
            name,
            value_type,
            properties,
            publishers: BTreeSet::new(),
            removed: false,
            created_at: Instant::now(),
        }
    }

    /// Number of publishers bound to the topic
    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    /// Whether the topic should be deleted now
    ///
    /// True when no publisher is left and neither the retained nor the
    /// persistent flag is set.
    pub fn is_orphaned(&self) -> bool {
        self.publishers.is_empty() && !self.properties.keeps_topic()
    }

    /// Snapshot for callers outside the registry
    pub fn info(&self) -> TopicInfo {
        TopicInfo {
            id: self.id,
            name: Arc::clone(&self.name),
            value_type: self.value_type,
            properties: self.properties.clone(),
        }
    }
}

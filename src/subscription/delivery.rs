//! Delivery types
//!
//! What the engine enqueues for a subscriber. Every subscriber owns the
//! sending half of an unbounded channel; the receiving half is a connection
//! worker's outbox, a local subscriber handle, or a listener thread.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::registry::{TopicId, TopicInfo};
use crate::value::{PropertyUpdate, TimestampedValue};

/// Engine-assigned subscriber identifier
pub type SubscriberId = u64;

/// Sending half of a subscriber's delivery queue
pub type DeliverySender = mpsc::UnboundedSender<Delivery>;

/// Receiving half of a subscriber's delivery queue
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Create a delivery queue
pub fn delivery_channel() -> (DeliverySender, DeliveryReceiver) {
    mpsc::unbounded_channel()
}

/// A single enqueued delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Subscriber the delivery is for
    pub subscriber: SubscriberId,
    pub event: DeliveryEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    /// A matching topic exists (on subscribe, or newly created)
    Announced(TopicInfo),
    /// A matching topic was deleted
    Unannounced { id: TopicId, name: Arc<str> },
    /// A matching topic's properties changed
    PropertiesChanged {
        topic: TopicInfo,
        update: PropertyUpdate,
    },
    /// A new value for a matching topic
    Value {
        id: TopicId,
        name: Arc<str>,
        value: TimestampedValue,
    },
}

impl DeliveryEvent {
    pub fn topic_id(&self) -> TopicId {
        match self {
            DeliveryEvent::Announced(topic) => topic.id,
            DeliveryEvent::Unannounced { id, .. } => *id,
            DeliveryEvent::PropertiesChanged { topic, .. } => topic.id,
            DeliveryEvent::Value { id, .. } => *id,
        }
    }

    pub fn topic_name(&self) -> &str {
        match self {
            DeliveryEvent::Announced(topic) => &topic.name,
            DeliveryEvent::Unannounced { name, .. } => name,
            DeliveryEvent::PropertiesChanged { topic, .. } => &topic.name,
            DeliveryEvent::Value { name, .. } => name,
        }
    }
}

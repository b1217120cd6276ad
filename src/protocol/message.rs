//! Protocol messages

use crate::registry::TopicId;
use crate::session::ClientId;
use crate::subscription::SubscriberOptions;
use crate::value::{Properties, PropertyUpdate, Value, ValueType};

use super::constants::*;

/// A message exchanged between client and server
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client → server: first message on a connection
    Hello { version: u16, name: String },

    /// Server → client: handshake accepted
    HelloAck {
        version: u16,
        client_id: ClientId,
        server_time: i64,
    },

    /// Server → client: handshake refused, connection will close
    Reject { server_version: u16, reason: String },

    /// Client → server: start publishing (`id` 0, `pubuid` set).
    /// Server → client: topic exists (`id` assigned, `pubuid` echoed to the
    /// publisher only).
    Announce {
        name: String,
        id: TopicId,
        pubuid: Option<u32>,
        value_type: ValueType,
        properties: Properties,
    },

    /// Client → server: stop publishing `pubuid`.
    /// Server → client: topic `id` was deleted.
    Unannounce {
        name: String,
        id: TopicId,
        pubuid: Option<u32>,
    },

    Subscribe {
        subuid: u32,
        patterns: Vec<String>,
        options: SubscriberOptions,
    },

    Unsubscribe { subuid: u32 },

    SetProperties { name: String, update: PropertyUpdate },

    /// Client → server: `id` is the pubuid.
    /// Server → client: `id` is the topic id.
    Value {
        id: u32,
        timestamp: i64,
        value: Value,
    },

    /// Client sends its clock; server echoes with its own
    KeepAlive { timestamp: i64, server_time: i64 },
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Hello { .. } => TAG_HELLO,
            Message::HelloAck { .. } => TAG_HELLO_ACK,
            Message::Reject { .. } => TAG_REJECT,
            Message::Announce { .. } => TAG_ANNOUNCE,
            Message::Unannounce { .. } => TAG_UNANNOUNCE,
            Message::Subscribe { .. } => TAG_SUBSCRIBE,
            Message::Unsubscribe { .. } => TAG_UNSUBSCRIBE,
            Message::SetProperties { .. } => TAG_SET_PROPERTIES,
            Message::Value { .. } => TAG_VALUE,
            Message::KeepAlive { .. } => TAG_KEEP_ALIVE,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::HelloAck { .. } => "hello-ack",
            Message::Reject { .. } => "reject",
            Message::Announce { .. } => "announce",
            Message::Unannounce { .. } => "unannounce",
            Message::Subscribe { .. } => "subscribe",
            Message::Unsubscribe { .. } => "unsubscribe",
            Message::SetProperties { .. } => "set-properties",
            Message::Value { .. } => "value",
            Message::KeepAlive { .. } => "keep-alive",
        }
    }

    /// Whether the message may only appear during the handshake
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Message::Hello { .. } | Message::HelloAck { .. } | Message::Reject { .. }
        )
    }
}

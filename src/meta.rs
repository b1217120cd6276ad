//! Introspection metadata
//!
//! Snapshots of who is connected and who publishes or subscribes to what,
//! with raw encodings built from the wire primitives. When enabled, the
//! instance keeps these up to date under reserved topic names:
//!
//! ```text
//! $clients              every connected client           [ClientMeta]
//! $clientpub$<client>   publishers of one client         [ClientPublisher]
//! $clientsub$<client>   subscribers of one client        [ClientSubscriber]
//! $pub$<topic>          publishers of one topic          [TopicPublisher]
//! $sub$<topic>          subscribers matching one topic   [TopicSubscriber]
//! ```
//!
//! Every encoding is a varint count followed by the entries.

use bytes::{Bytes, BytesMut};

use crate::error::CodecError;
use crate::protocol::wire::*;
use crate::session::ClientId;
use crate::subscription::SubscriberOptions;

pub const CLIENTS_TOPIC: &str = "$clients";
pub const CLIENT_PUB_PREFIX: &str = "$clientpub$";
pub const CLIENT_SUB_PREFIX: &str = "$clientsub$";
pub const TOPIC_PUB_PREFIX: &str = "$pub$";
pub const TOPIC_SUB_PREFIX: &str = "$sub$";

pub fn client_pub_topic(client: ClientId) -> String {
    format!("{}{}", CLIENT_PUB_PREFIX, client)
}

pub fn client_sub_topic(client: ClientId) -> String {
    format!("{}{}", CLIENT_SUB_PREFIX, client)
}

pub fn topic_pub_topic(topic: &str) -> String {
    format!("{}{}", TOPIC_PUB_PREFIX, topic)
}

pub fn topic_sub_topic(topic: &str) -> String {
    format!("{}{}", TOPIC_SUB_PREFIX, topic)
}

/// A connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMeta {
    pub id: ClientId,
    pub name: String,
    /// Peer address, empty for local clients
    pub peer: String,
    pub version: u16,
}

/// A publisher, as seen from its client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPublisher {
    pub uid: u32,
    pub topic: String,
}

/// A subscriber, as seen from its client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubscriber {
    pub uid: u32,
    pub topics: Vec<String>,
    pub options: SubscriberOptions,
}

/// A publisher, as seen from its topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicPublisher {
    pub client: ClientId,
    pub pubuid: u32,
}

/// A subscriber, as seen from a topic it matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscriber {
    pub client: ClientId,
    pub subuid: u32,
    pub options: SubscriberOptions,
}

fn encode_list<T>(items: &[T], mut put: impl FnMut(&mut BytesMut, &T)) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_varint(&mut buf, items.len() as u64);
    for item in items {
        put(&mut buf, item);
    }
    buf.to_vec()
}

fn decode_list<T>(
    data: &[u8],
    mut get: impl FnMut(&mut Bytes) -> Result<T, CodecError>,
) -> Result<Vec<T>, CodecError> {
    let mut buf = Bytes::copy_from_slice(data);
    let count = get_varint(&mut buf)?;
    if count > buf.len() as u64 {
        return Err(CodecError::Truncated);
    }

    let items = (0..count)
        .map(|_| get(&mut buf))
        .collect::<Result<Vec<_>, _>>()?;

    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes(buf.len()));
    }
    Ok(items)
}

pub fn encode_clients(clients: &[ClientMeta]) -> Vec<u8> {
    encode_list(clients, |buf, c| {
        put_varint(buf, c.id);
        put_string(buf, &c.name);
        put_string(buf, &c.peer);
        put_varint(buf, c.version as u64);
    })
}

pub fn decode_clients(data: &[u8]) -> Result<Vec<ClientMeta>, CodecError> {
    decode_list(data, |buf| {
        Ok(ClientMeta {
            id: get_varint(buf)?,
            name: get_string(buf)?,
            peer: get_string(buf)?,
            version: u16::try_from(get_varint(buf)?).map_err(|_| CodecError::MalformedVarint)?,
        })
    })
}

pub fn encode_client_publishers(publishers: &[ClientPublisher]) -> Vec<u8> {
    encode_list(publishers, |buf, p| {
        put_varint(buf, p.uid as u64);
        put_string(buf, &p.topic);
    })
}

pub fn decode_client_publishers(data: &[u8]) -> Result<Vec<ClientPublisher>, CodecError> {
    decode_list(data, |buf| {
        Ok(ClientPublisher {
            uid: get_u32_varint(buf)?,
            topic: get_string(buf)?,
        })
    })
}

pub fn encode_client_subscribers(subscribers: &[ClientSubscriber]) -> Vec<u8> {
    encode_list(subscribers, |buf, s| {
        put_varint(buf, s.uid as u64);
        put_varint(buf, s.topics.len() as u64);
        for topic in &s.topics {
            put_string(buf, topic);
        }
        put_options(buf, &s.options);
    })
}

pub fn decode_client_subscribers(data: &[u8]) -> Result<Vec<ClientSubscriber>, CodecError> {
    decode_list(data, |buf| {
        let uid = get_u32_varint(buf)?;
        let count = get_varint(buf)?;
        if count > buf.len() as u64 {
            return Err(CodecError::Truncated);
        }
        let topics = (0..count)
            .map(|_| get_string(buf))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClientSubscriber {
            uid,
            topics,
            options: get_options(buf)?,
        })
    })
}

pub fn encode_topic_publishers(publishers: &[TopicPublisher]) -> Vec<u8> {
    encode_list(publishers, |buf, p| {
        put_varint(buf, p.client);
        put_varint(buf, p.pubuid as u64);
    })
}

pub fn decode_topic_publishers(data: &[u8]) -> Result<Vec<TopicPublisher>, CodecError> {
    decode_list(data, |buf| {
        Ok(TopicPublisher {
            client: get_varint(buf)?,
            pubuid: get_u32_varint(buf)?,
        })
    })
}

pub fn encode_topic_subscribers(subscribers: &[TopicSubscriber]) -> Vec<u8> {
    encode_list(subscribers, |buf, s| {
        put_varint(buf, s.client);
        put_varint(buf, s.subuid as u64);
        put_options(buf, &s.options);
    })
}

pub fn decode_topic_subscribers(data: &[u8]) -> Result<Vec<TopicSubscriber>, CodecError> {
    decode_list(data, |buf| {
        Ok(TopicSubscriber {
            client: get_varint(buf)?,
            subuid: get_u32_varint(buf)?,
            options: get_options(buf)?,
        })
    })
}

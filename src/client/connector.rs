//! Remote table client
//!
//! A thin, single-task client: it owns the socket, sends requests and hands
//! every inbound message back through [`TableClient::recv`]. Announced topics
//! are tracked so callers can resolve the ids carried by value messages.

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::{encode_into, FrameDecoder, Handshake, HandshakeRole, Message, Negotiated};
use crate::registry::TopicId;
use crate::session::ClientId;
use crate::storage::now_micros;
use crate::subscription::SubscriberOptions;
use crate::value::{Properties, PropertyUpdate, Value, ValueType};

use super::config::ClientConfig;

/// A topic the server announced to this client
#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncedTopic {
    pub id: TopicId,
    pub name: String,
    pub value_type: ValueType,
    pub properties: Properties,
    /// Set when the announcement answers one of our publish requests
    pub pubuid: Option<u32>,
}

/// Connection to a remote table server
pub struct TableClient {
    stream: TcpStream,
    config: ClientConfig,
    decoder: FrameDecoder,
    write_buf: BytesMut,
    negotiated: Negotiated,

    topics: HashMap<TopicId, AnnouncedTopic>,
    publishers: HashMap<u32, String>,
    next_pubuid: u32,
    next_subuid: u32,

    last_sent: Instant,
    /// Cleared once the server closes or a write fails
    connected: bool,
    /// Server clock minus local clock, from the last keep-alive echo
    time_offset: Option<i64>,
}

impl TableClient {
    /// Connect and complete the handshake
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let timeout = config.connect_timeout;
        tokio::time::timeout(timeout, Self::establish(config)).await?
    }

    async fn establish(config: ClientConfig) -> Result<Self> {
        let mut stream = TcpStream::connect(&config.server_addr).await?;
        if config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }

        let mut handshake = Handshake::new(HandshakeRole::Client);
        let mut write_buf = BytesMut::with_capacity(4096);
        encode_into(&handshake.hello(&config.client_name), &mut write_buf);
        stream.write_all(&write_buf).await?;
        write_buf.clear();

        let mut decoder = FrameDecoder::with_max_frame_size(config.max_frame_size);
        let reply = read_message(&mut stream, &mut decoder).await?;
        let negotiated = handshake.on_reply(&reply)?;

        tracing::info!(
            server = %config.server_addr,
            client_id = negotiated.client_id,
            version = negotiated.version,
            "Connected"
        );

        Ok(Self {
            stream,
            config,
            decoder,
            write_buf,
            negotiated,
            topics: HashMap::new(),
            publishers: HashMap::new(),
            next_pubuid: 1,
            next_subuid: 1,
            last_sent: Instant::now(),
            connected: true,
            time_offset: None,
        })
    }

    /// Server-assigned client id
    pub fn client_id(&self) -> ClientId {
        self.negotiated.client_id
    }

    /// Negotiated protocol version
    pub fn version(&self) -> u16 {
        self.negotiated.version
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Estimated server clock minus local clock, in microseconds
    pub fn time_offset(&self) -> Option<i64> {
        self.time_offset
    }

    pub fn topic(&self, id: TopicId) -> Option<&AnnouncedTopic> {
        self.topics.get(&id)
    }

    pub fn topic_by_name(&self, name: &str) -> Option<&AnnouncedTopic> {
        self.topics.values().find(|t| t.name == name)
    }

    /// Topics currently announced to this client, ordered by id
    pub fn topics(&self) -> Vec<&AnnouncedTopic> {
        let mut topics: Vec<_> = self.topics.values().collect();
        topics.sort_by_key(|t| t.id);
        topics
    }

    /// Start publishing; returns the publisher uid
    ///
    /// The server confirms with an Announce carrying this uid.
    pub async fn publish(
        &mut self,
        name: &str,
        value_type: ValueType,
        properties: &Properties,
    ) -> Result<u32> {
        let pubuid = self.next_pubuid;
        self.next_pubuid += 1;

        self.send(&Message::Announce {
            name: name.to_string(),
            id: 0,
            pubuid: Some(pubuid),
            value_type,
            properties: properties.clone(),
        })
        .await?;
        self.publishers.insert(pubuid, name.to_string());
        Ok(pubuid)
    }

    pub async fn unpublish(&mut self, pubuid: u32) -> Result<()> {
        let name = self.publishers.remove(&pubuid).unwrap_or_default();
        self.send(&Message::Unannounce {
            name,
            id: 0,
            pubuid: Some(pubuid),
        })
        .await
    }

    /// Write a value through a publisher
    ///
    /// A `timestamp` of 0 lets the server stamp the value on arrival.
    pub async fn set_value(
        &mut self,
        pubuid: u32,
        value: impl Into<Value>,
        timestamp: i64,
    ) -> Result<()> {
        self.send(&Message::Value {
            id: pubuid,
            timestamp,
            value: value.into(),
        })
        .await
    }

    /// Subscribe; returns the subscriber uid
    pub async fn subscribe(&mut self, patterns: &[&str], options: SubscriberOptions) -> Result<u32> {
        let subuid = self.next_subuid;
        self.next_subuid += 1;

        self.send(&Message::Subscribe {
            subuid,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            options,
        })
        .await?;
        Ok(subuid)
    }

    pub async fn unsubscribe(&mut self, subuid: u32) -> Result<()> {
        self.send(&Message::Unsubscribe { subuid }).await
    }

    pub async fn set_properties(&mut self, name: &str, update: PropertyUpdate) -> Result<()> {
        self.send(&Message::SetProperties {
            name: name.to_string(),
            update,
        })
        .await
    }

    pub async fn keep_alive(&mut self) -> Result<()> {
        self.send(&Message::KeepAlive {
            timestamp: now_micros(),
            server_time: 0,
        })
        .await
    }

    /// Next message from the server
    ///
    /// Sends keep-alives while waiting. Announcements are recorded before
    /// the message is returned.
    pub async fn recv(&mut self) -> Result<Message> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        loop {
            match self.decoder.decode() {
                Ok(Some(message)) => {
                    self.track(&message);
                    return Ok(message);
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping undecodable frame");
                    continue;
                }
            }

            let deadline = self.last_sent + self.config.keep_alive_interval;
            tokio::select! {
                result = self.stream.read_buf(self.decoder.buffer_mut()) => {
                    match result {
                        Ok(0) => {
                            self.connected = false;
                            return Err(Error::ConnectionClosed);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.connected = false;
                            return Err(e.into());
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.keep_alive().await?;
                }
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn track(&mut self, message: &Message) {
        match message {
            Message::Announce {
                name,
                id,
                pubuid,
                value_type,
                properties,
            } => {
                self.topics.insert(
                    *id,
                    AnnouncedTopic {
                        id: *id,
                        name: name.clone(),
                        value_type: *value_type,
                        properties: properties.clone(),
                        pubuid: *pubuid,
                    },
                );
            }
            Message::Unannounce { id, .. } => {
                self.topics.remove(id);
            }
            Message::SetProperties { name, update } => {
                if let Some(topic) = self.topics.values_mut().find(|t| &t.name == name) {
                    topic.properties.apply(update);
                }
            }
            Message::KeepAlive {
                timestamp,
                server_time,
            } => {
                let now = now_micros();
                let rtt = now - timestamp;
                self.time_offset = Some(server_time + rtt / 2 - now);
            }
            _ => {}
        }
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        encode_into(message, &mut self.write_buf);
        let result = self.stream.write_all(&self.write_buf).await;
        self.write_buf.clear();
        if let Err(e) = result {
            self.connected = false;
            return Err(e.into());
        }
        self.last_sent = Instant::now();
        Ok(())
    }
}

async fn read_message(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Result<Message> {
    loop {
        if let Some(message) = decoder.decode()? {
            return Ok(message);
        }
        if stream.read_buf(decoder.buffer_mut()).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use crate::error::HandshakeError;
    use crate::server::{ServerConfig, TableServer};

    async fn start_server(config: ServerConfig) -> (Arc<TableServer>, SocketAddr, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(TableServer::new(config));
        let (tx, rx) = oneshot::channel();

        let task_server = Arc::clone(&server);
        tokio::spawn(async move {
            task_server
                .serve_until(listener, async {
                    let _ = rx.await;
                })
                .await
        });

        (server, addr, tx)
    }

    async fn connect(addr: SocketAddr, name: &str) -> TableClient {
        TableClient::connect(ClientConfig::new(addr.to_string()).name(name))
            .await
            .unwrap()
    }

    async fn recv(client: &mut TableClient) -> Message {
        tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_over_tcp() {
        let (server, addr, shutdown) = start_server(ServerConfig::default().disable_meta_topics()).await;

        let mut publisher = connect(addr, "pub").await;
        let pubuid = publisher
            .publish("/robot/speed", ValueType::Double, &Properties::new())
            .await
            .unwrap();

        match recv(&mut publisher).await {
            Message::Announce { name, pubuid: uid, .. } => {
                assert_eq!(name, "/robot/speed");
                assert_eq!(uid, Some(pubuid));
            }
            other => panic!("unexpected {:?}", other),
        }
        publisher.set_value(pubuid, 2.5, 1_000).await.unwrap();

        let mut subscriber = connect(addr, "sub").await;
        subscriber
            .subscribe(&["/robot/"], SubscriberOptions::default().prefix_match(true))
            .await
            .unwrap();

        let id = match recv(&mut subscriber).await {
            Message::Announce { name, id, pubuid, .. } => {
                assert_eq!(name, "/robot/speed");
                assert_eq!(pubuid, None);
                id
            }
            other => panic!("unexpected {:?}", other),
        };

        match recv(&mut subscriber).await {
            Message::Value {
                id: value_id,
                timestamp,
                value,
            } => {
                assert_eq!(value_id, id);
                assert_eq!(timestamp, 1_000);
                assert_eq!(value, Value::Double(2.5));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(subscriber.topic(id).unwrap().value_type, ValueType::Double);

        // Dropping the only publisher deletes the topic
        publisher.close().await.unwrap();
        match recv(&mut subscriber).await {
            Message::Unannounce { id: gone, .. } => assert_eq!(gone, id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(subscriber.topic(id).is_none());
        assert!(server.instance().topic("/robot/speed").is_err());

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_rate_limited_subscriber_gets_last_of_burst() {
        let (_server, addr, shutdown) = start_server(ServerConfig::default().disable_meta_topics()).await;

        let mut subscriber = connect(addr, "sub").await;
        subscriber
            .subscribe(&["/burst"], SubscriberOptions::default().periodic(Duration::from_millis(200)))
            .await
            .unwrap();

        let mut publisher = connect(addr, "pub").await;
        let pubuid = publisher
            .publish("/burst", ValueType::Int, &Properties::new())
            .await
            .unwrap();
        assert!(matches!(recv(&mut publisher).await, Message::Announce { .. }));
        assert!(matches!(recv(&mut subscriber).await, Message::Announce { .. }));

        for i in 1..=5i64 {
            publisher.set_value(pubuid, i, i).await.unwrap();
        }

        // Leading value at once, the last of the burst from the flush task
        let mut values = Vec::new();
        while values.last() != Some(&5) {
            if let Message::Value { value, .. } = recv(&mut subscriber).await {
                values.push(value.as_i64().unwrap());
            }
        }
        assert_eq!(values, vec![1, 5]);

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_keep_alive_sets_time_offset() {
        let (_server, addr, shutdown) = start_server(ServerConfig::default()).await;

        let mut client = connect(addr, "clock").await;
        assert!(client.time_offset().is_none());

        client.keep_alive().await.unwrap();
        loop {
            if let Message::KeepAlive { .. } = recv(&mut client).await {
                break;
            }
        }
        assert!(client.time_offset().is_some());

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_meta_topics_visible_to_subscribers() {
        let (_server, addr, shutdown) = start_server(ServerConfig::default()).await;

        let mut client = connect(addr, "meta").await;
        client
            .subscribe(&["$clients"], SubscriberOptions::default())
            .await
            .unwrap();

        loop {
            if let Message::Value { id, .. } = recv(&mut client).await {
                assert_eq!(client.topic(id).unwrap().name, "$clients");
                break;
            }
        }

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_not_connected_after_server_close() {
        // Accepts the handshake, then hangs up
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            let _hello = read_message(&mut socket, &mut decoder).await.unwrap();
            let mut buf = BytesMut::new();
            encode_into(
                &Message::HelloAck {
                    version: crate::protocol::PROTOCOL_VERSION,
                    client_id: 9,
                    server_time: 0,
                },
                &mut buf,
            );
            socket.write_all(&buf).await.unwrap();
        });

        let mut client = connect(addr, "late").await;
        assert_eq!(client.client_id(), 9);

        let result = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(!client.is_connected());
        assert!(matches!(client.keep_alive().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_refused_by_version() {
        // A server speaking another major version
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            let _hello = read_message(&mut socket, &mut decoder).await.unwrap();
            let mut buf = BytesMut::new();
            encode_into(
                &Message::Reject {
                    server_version: 0x0300,
                    reason: "unsupported protocol version".into(),
                },
                &mut buf,
            );
            socket.write_all(&buf).await.unwrap();
        });

        let result = TableClient::connect(ClientConfig::new(addr.to_string())).await;
        assert!(matches!(
            result,
            Err(Error::Handshake(HandshakeError::Rejected { server_version: 0x0300, .. }))
        ));
    }
}

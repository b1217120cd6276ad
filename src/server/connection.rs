//! Per-connection worker
//!
//! One task per client. After the handshake a single `select!` loop
//! multiplexes socket reads, the subscriber outbox and the idle timer:
//!
//! ```text
//!            ┌──────────── socket read ─────────────┐
//!            │                                       ▼
//!  client ◄──┤ write_buf ◄── outbox (deliveries)   FrameDecoder ──► Instance
//!            │                                       (announce, subscribe,
//!            └─────────── idle timeout ──────────►    value, keep-alive)
//! ```
//!
//! Every subscriber of this client delivers into the same outbox. A topic
//! is announced to the client once, however many of its subscribers match
//! it, and values are forwarded only if newer than the last one sent.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::protocol::{encode_into, FrameDecoder, Handshake, HandshakeRole, Message, ServerReply};
use crate::registry::TopicId;
use crate::server::config::ServerConfig;
use crate::session::{ClientId, ClientInfo, SessionState};
use crate::stats::{ConnectionStats, ServerStats};
use crate::storage::{now_micros, SetOutcome};
use crate::subscription::{delivery_channel, Delivery, DeliveryEvent, DeliveryReceiver, DeliverySender};

/// Connection worker for one client
pub struct Connection<S> {
    stream: S,
    state: SessionState,
    config: ServerConfig,
    instance: Arc<Instance>,
    server_stats: Arc<ServerStats>,
    stats: ConnectionStats,

    decoder: FrameDecoder,
    write_buf: BytesMut,

    outbox_tx: DeliverySender,
    outbox_rx: DeliveryReceiver,

    /// Topics announced to the client
    announced: HashSet<TopicId>,
    /// Last value sequence forwarded per topic
    sent_sequences: HashMap<TopicId, u64>,

    /// Registered with the instance (handshake done)
    attached: bool,

    /// Server clock in microseconds
    clock: fn() -> i64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer_addr: SocketAddr,
        config: ServerConfig,
        instance: Arc<Instance>,
        server_stats: Arc<ServerStats>,
    ) -> Self {
        let id = instance.clients().next_id();
        let (outbox_tx, outbox_rx) = delivery_channel();

        Self {
            stream,
            state: SessionState::new(id, peer_addr),
            decoder: FrameDecoder::with_max_frame_size(config.max_frame_size),
            write_buf: BytesMut::with_capacity(4096),
            config,
            instance,
            server_stats,
            stats: ConnectionStats::new(),
            outbox_tx,
            outbox_rx,
            announced: HashSet::new(),
            sent_sequences: HashMap::new(),
            attached: false,
            clock: now_micros,
        }
    }

    /// Replace the server clock used for HelloAck and keep-alive replies
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn client_id(&self) -> ClientId {
        self.state.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Run the connection to completion
    ///
    /// The client is released from the instance however the connection
    /// ends.
    pub async fn run(&mut self) -> Result<()> {
        self.state.start_handshake();

        let result = match tokio::time::timeout(self.config.handshake_timeout, self.handshake()).await {
            Ok(Ok(())) => self.active_loop().await,
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(client_id = self.state.id, peer = %self.state.peer_addr, "Handshake timed out");
                Err(Error::Timeout)
            }
        };

        self.cleanup();
        result
    }

    async fn handshake(&mut self) -> Result<()> {
        let message = loop {
            if let Some(message) = self.next_buffered()? {
                break message;
            }
            if self.fill().await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        };

        let mut handshake = Handshake::new(HandshakeRole::Server);
        match handshake.accept(&message, self.state.id, (self.clock)()) {
            ServerReply::Accepted {
                reply,
                name,
                version,
            } => {
                self.send(&reply);
                self.flush().await?;

                self.state.complete_handshake(version, name.clone());
                self.instance.attach(ClientInfo::new(
                    self.state.id,
                    name,
                    Some(self.state.peer_addr),
                    version,
                ));
                self.attached = true;
                self.server_stats.connection_opened();
                Ok(())
            }
            ServerReply::Rejected { reply, error } => {
                self.send(&reply);
                let _ = self.flush().await;
                self.server_stats.connection_rejected();

                tracing::warn!(
                    client_id = self.state.id,
                    peer = %self.state.peer_addr,
                    error = %error,
                    "Handshake rejected"
                );
                Err(error.into())
            }
        }
    }

    async fn active_loop(&mut self) -> Result<()> {
        loop {
            while let Some(message) = self.next_buffered()? {
                self.handle_message(message);
            }
            self.flush().await?;

            let idle = self.state.idle_for(std::time::Instant::now());
            let idle_deadline =
                tokio::time::Instant::now() + self.config.idle_timeout.saturating_sub(idle);
            self.decoder.buffer_mut().reserve(self.config.read_buffer_size);

            tokio::select! {
                result = self.stream.read_buf(self.decoder.buffer_mut()) => {
                    let n = result?;
                    if n == 0 {
                        self.state.begin_disconnect();
                        tracing::debug!(client_id = self.state.id, "Peer closed connection");
                        return Ok(());
                    }
                    self.stats.bytes_received += n as u64;
                    self.state.touch();
                }
                Some(delivery) = self.outbox_rx.recv() => {
                    self.queue_delivery(delivery);
                    while let Ok(delivery) = self.outbox_rx.try_recv() {
                        self.queue_delivery(delivery);
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    tracing::warn!(
                        client_id = self.state.id,
                        idle_secs = self.config.idle_timeout.as_secs(),
                        "Idle timeout"
                    );
                    return Err(Error::Timeout);
                }
            }
        }
    }

    /// Read more bytes into the decoder
    async fn fill(&mut self) -> Result<usize> {
        self.decoder.buffer_mut().reserve(self.config.read_buffer_size);
        let n = self.stream.read_buf(self.decoder.buffer_mut()).await?;
        self.stats.bytes_received += n as u64;
        if n > 0 {
            self.state.touch();
        }
        Ok(n)
    }

    /// Next complete message, skipping frames that fail to decode
    fn next_buffered(&mut self) -> Result<Option<Message>> {
        loop {
            match self.decoder.decode() {
                Ok(message) => {
                    if message.is_some() {
                        self.stats.messages_received += 1;
                    }
                    return Ok(message);
                }
                Err(e) if e.is_fatal() => {
                    tracing::warn!(client_id = self.state.id, error = %e, "Unrecoverable framing error");
                    return Err(e.into());
                }
                Err(e) => {
                    self.stats.codec_errors += 1;
                    tracing::warn!(client_id = self.state.id, error = %e, "Dropping undecodable frame");
                }
            }
        }
    }

    /// Apply one inbound message
    ///
    /// Failures are logged and the message dropped; they never close the
    /// connection.
    fn handle_message(&mut self, message: Message) {
        let client = self.state.id;
        tracing::trace!(client_id = client, kind = message.kind(), "Message received");

        match message {
            Message::Announce {
                name,
                pubuid: Some(pubuid),
                value_type,
                properties,
                ..
            } => match self
                .instance
                .publish(client, pubuid, &name, value_type, &properties)
            {
                Ok(topic) => {
                    self.announced.insert(topic.id);
                    self.send(&Message::Announce {
                        name,
                        id: topic.id,
                        pubuid: Some(pubuid),
                        value_type: topic.value_type,
                        properties: topic.properties,
                    });
                }
                Err(e) => {
                    tracing::warn!(client_id = client, topic = %name, error = %e, "Publish refused");
                }
            },
            Message::Unannounce {
                pubuid: Some(pubuid),
                ..
            } => {
                let topic = self
                    .instance
                    .clients()
                    .publisher_topic(client, pubuid)
                    .and_then(|id| self.instance.registry().lookup_id(id).ok());

                match self.instance.unpublish(client, pubuid) {
                    Ok(()) => {
                        if let Some(topic) = topic {
                            self.release_if_deleted(topic.id, &topic.name);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(client_id = client, pubuid = pubuid, error = %e, "Unpublish ignored");
                    }
                }
            }
            Message::Subscribe {
                subuid,
                patterns,
                options,
            } => {
                if let Err(e) =
                    self.instance
                        .subscribe(client, subuid, &patterns, options, self.outbox_tx.clone())
                {
                    tracing::warn!(client_id = client, subuid = subuid, error = %e, "Subscribe refused");
                }
            }
            Message::Unsubscribe { subuid } => {
                if let Err(e) = self.instance.unsubscribe(client, subuid) {
                    tracing::debug!(client_id = client, subuid = subuid, error = %e, "Unsubscribe ignored");
                }
            }
            Message::SetProperties { name, update } => {
                if let Err(e) = self.instance.set_properties(&name, &update) {
                    tracing::warn!(client_id = client, topic = %name, error = %e, "Property update refused");
                }
            }
            Message::Value {
                id,
                timestamp,
                value,
            } => match self.instance.set_value(client, id, value, timestamp) {
                Ok(SetOutcome::Stale) => self.stats.stale_values += 1,
                Ok(SetOutcome::Stored(_)) => {}
                Err(e) => {
                    tracing::warn!(client_id = client, pubuid = id, error = %e, "Value dropped");
                }
            },
            Message::KeepAlive { timestamp, .. } => {
                self.send(&Message::KeepAlive {
                    timestamp,
                    server_time: (self.clock)(),
                });
            }
            other if other.is_handshake() => {
                tracing::warn!(client_id = client, kind = other.kind(), "Handshake message after handshake dropped");
            }
            other => {
                tracing::warn!(client_id = client, kind = other.kind(), "Unexpected message dropped");
            }
        }
    }

    /// Tell the client a topic it published is gone
    ///
    /// Subscriber deliveries for the same topic are deduplicated against
    /// `announced`, so the client hears of the removal once.
    fn release_if_deleted(&mut self, id: TopicId, name: &str) {
        if self.instance.registry().lookup_id(id).is_ok() || !self.announced.remove(&id) {
            return;
        }
        self.sent_sequences.remove(&id);
        self.send(&Message::Unannounce {
            name: name.to_string(),
            id,
            pubuid: None,
        });
    }

    /// Translate a delivery into an outbound message
    fn queue_delivery(&mut self, delivery: Delivery) {
        tracing::trace!(
            client_id = self.state.id,
            subscriber = delivery.subscriber,
            topic_id = delivery.event.topic_id(),
            "Delivery"
        );
        match delivery.event {
            DeliveryEvent::Announced(topic) => {
                if self.announced.insert(topic.id) {
                    self.send(&Message::Announce {
                        name: topic.name.to_string(),
                        id: topic.id,
                        pubuid: None,
                        value_type: topic.value_type,
                        properties: topic.properties,
                    });
                }
            }
            DeliveryEvent::Unannounced { id, name } => {
                if self.announced.remove(&id) {
                    self.sent_sequences.remove(&id);
                    self.send(&Message::Unannounce {
                        name: name.to_string(),
                        id,
                        pubuid: None,
                    });
                }
            }
            DeliveryEvent::PropertiesChanged { topic, update } => {
                if self.announced.contains(&topic.id) {
                    self.send(&Message::SetProperties {
                        name: topic.name.to_string(),
                        update,
                    });
                }
            }
            DeliveryEvent::Value { id, value, .. } => {
                if !self.announced.contains(&id) {
                    return;
                }
                let last = self.sent_sequences.entry(id).or_insert(0);
                if value.sequence <= *last {
                    return;
                }
                *last = value.sequence;
                self.send(&Message::Value {
                    id,
                    timestamp: value.timestamp,
                    value: value.value,
                });
            }
        }
    }

    fn send(&mut self, message: &Message) {
        encode_into(message, &mut self.write_buf);
        self.stats.messages_sent += 1;
    }

    async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        self.write_buf.clear();
        Ok(())
    }

    fn cleanup(&mut self) {
        self.state.close();
        self.stats.duration = self.state.duration();

        if self.attached {
            self.attached = false;
            if let Err(e) = self.instance.disconnect(self.state.id) {
                tracing::debug!(client_id = self.state.id, error = %e, "Client already released");
            }
            self.server_stats.connection_closed(&self.stats);
        }

        tracing::debug!(
            client_id = self.state.id,
            bytes_received = self.stats.bytes_received,
            bytes_sent = self.stats.bytes_sent,
            codec_errors = self.stats.codec_errors,
            "Connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_test::io::Builder;

    use crate::error::HandshakeError;
    use crate::instance::InstanceConfig;
    use crate::protocol::{encode, PROTOCOL_VERSION};
    use crate::subscription::SubscriberOptions;
    use crate::value::{Properties, Value, ValueType};

    const SERVER_TIME: i64 = 1_000_000;

    fn fixed_clock() -> i64 {
        SERVER_TIME
    }

    fn frame(message: &Message) -> Vec<u8> {
        encode(message).to_vec()
    }

    fn frames(messages: &[Message]) -> Vec<u8> {
        messages.iter().flat_map(frame).collect()
    }

    fn hello(version: u16) -> Vec<u8> {
        frame(&Message::Hello {
            version,
            name: "test".into(),
        })
    }

    fn hello_ack(client_id: ClientId) -> Vec<u8> {
        frame(&Message::HelloAck {
            version: PROTOCOL_VERSION,
            client_id,
            server_time: SERVER_TIME,
        })
    }

    fn setup() -> (Arc<Instance>, Arc<ServerStats>) {
        (
            Arc::new(Instance::new(InstanceConfig::new().meta_topics(false))),
            Arc::new(ServerStats::new()),
        )
    }

    fn connection<S>(stream: S, instance: &Arc<Instance>, stats: &Arc<ServerStats>) -> Connection<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        Connection::new(
            stream,
            peer,
            ServerConfig::default(),
            Arc::clone(instance),
            Arc::clone(stats),
        )
        .with_clock(fixed_clock)
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (instance, stats) = setup();
        let mock = Builder::new()
            .read(&hello(0x0300))
            .write(&frame(&Message::Reject {
                server_version: PROTOCOL_VERSION,
                reason: "unsupported protocol version".into(),
            }))
            .build();

        let mut conn = connection(mock, &instance, &stats);
        let err = conn.run().await.unwrap_err();

        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::ProtocolVersionMismatch { remote: 0x0300, .. })
        ));
        assert!(conn.state().is_closed());
        assert!(instance.clients().is_empty());
        assert_eq!(stats.snapshot().rejected_connections, 1);
    }

    #[tokio::test]
    async fn test_publish_value_and_keep_alive() {
        let (instance, stats) = setup();

        let inbound = frames(&[
            Message::Announce {
                name: "/t".into(),
                id: 0,
                pubuid: Some(1),
                value_type: ValueType::Double,
                properties: Properties::retained(),
            },
            Message::Value {
                id: 1,
                timestamp: 10,
                value: Value::Double(1.0),
            },
            Message::KeepAlive {
                timestamp: 5,
                server_time: 0,
            },
        ]);
        let outbound = frames(&[
            Message::Announce {
                name: "/t".into(),
                id: 1,
                pubuid: Some(1),
                value_type: ValueType::Double,
                properties: Properties::retained(),
            },
            Message::KeepAlive {
                timestamp: 5,
                server_time: SERVER_TIME,
            },
        ]);

        let mock = Builder::new()
            .read(&hello(PROTOCOL_VERSION))
            .write(&hello_ack(1))
            .read(&inbound)
            .write(&outbound)
            .build();

        let mut conn = connection(mock, &instance, &stats);
        conn.run().await.unwrap();

        assert_eq!(conn.stats().messages_received, 4);
        assert!(instance.clients().is_empty());

        // Retained topic outlives the connection with its value
        let stored = instance.get_value("/t").unwrap();
        assert_eq!(stored.value, Value::Double(1.0));
        assert_eq!(stored.timestamp, 10);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_announce_and_value() {
        let (instance, stats) = setup();
        let robot = instance.local_client("robot");
        let publisher = robot.publish("/x", ValueType::Int).unwrap();
        publisher.set_at(7i64, 100).unwrap();

        let subscribe = frame(&Message::Subscribe {
            subuid: 1,
            patterns: vec!["/x".into()],
            options: SubscriberOptions::default(),
        });
        let expected = frames(&[
            Message::Announce {
                name: "/x".into(),
                id: 1,
                pubuid: None,
                value_type: ValueType::Int,
                properties: Properties::new(),
            },
            Message::Value {
                id: 1,
                timestamp: 100,
                value: Value::Int(7),
            },
        ]);

        let mock = Builder::new()
            .read(&hello(PROTOCOL_VERSION))
            .write(&hello_ack(2))
            .read(&subscribe)
            .write(&expected)
            .build();

        let mut conn = connection(mock, &instance, &stats);
        conn.run().await.unwrap();

        // Subscriber released with the connection
        assert!(instance.engine().is_empty());
    }

    #[tokio::test]
    async fn test_bad_frame_skipped() {
        let (instance, stats) = setup();

        let mut inbound = vec![0x7F, 0, 0, 0, 1, 0xAA];
        inbound.extend(frame(&Message::KeepAlive {
            timestamp: 1,
            server_time: 0,
        }));

        let mock = Builder::new()
            .read(&hello(PROTOCOL_VERSION))
            .write(&hello_ack(1))
            .read(&inbound)
            .write(&frame(&Message::KeepAlive {
                timestamp: 1,
                server_time: SERVER_TIME,
            }))
            .build();

        let mut conn = connection(mock, &instance, &stats);
        conn.run().await.unwrap();
        assert_eq!(conn.stats().codec_errors, 1);
    }

    #[tokio::test]
    async fn test_stale_value_counted() {
        let (instance, stats) = setup();

        let inbound = frames(&[
            Message::Announce {
                name: "/s".into(),
                id: 0,
                pubuid: Some(4),
                value_type: ValueType::Int,
                properties: Properties::new(),
            },
            Message::Value {
                id: 4,
                timestamp: 105,
                value: Value::Int(2),
            },
            Message::Value {
                id: 4,
                timestamp: 100,
                value: Value::Int(1),
            },
        ]);

        let mock = Builder::new()
            .read(&hello(PROTOCOL_VERSION))
            .write(&hello_ack(1))
            .read(&inbound)
            .write(&frame(&Message::Announce {
                name: "/s".into(),
                id: 1,
                pubuid: Some(4),
                value_type: ValueType::Int,
                properties: Properties::new(),
            }))
            .build();

        let mut conn = connection(mock, &instance, &stats);
        conn.run().await.unwrap();
        assert_eq!(conn.stats().stale_values, 1);
        assert_eq!(stats.snapshot().stale_values, 1);
    }

    #[tokio::test]
    async fn test_closed_before_hello() {
        let (instance, stats) = setup();
        let mock = Builder::new().build();

        let mut conn = connection(mock, &instance, &stats);
        assert!(matches!(conn.run().await, Err(Error::ConnectionClosed)));
        assert_eq!(stats.snapshot().total_connections, 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (instance, stats) = setup();
        let mock = Builder::new().wait(Duration::from_secs(5)).build();

        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let config = ServerConfig::default().handshake_timeout(Duration::from_millis(50));
        let mut conn = Connection::new(mock, peer, config, instance, stats);

        assert!(matches!(conn.run().await, Err(Error::Timeout)));
    }
    #[tokio::test]
    async fn test_idle_timeout_releases_client() {
        let (instance, stats) = setup();
        let mock = Builder::new()
            .read(&hello(PROTOCOL_VERSION))
            .write(&hello_ack(1))
            .wait(Duration::from_millis(500))
            .build();

        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let config = ServerConfig::default().idle_timeout(Duration::from_millis(50));
        let mut conn = Connection::new(mock, peer, config, Arc::clone(&instance), Arc::clone(&stats))
            .with_clock(fixed_clock);

        assert!(matches!(conn.run().await, Err(Error::Timeout)));
        assert!(instance.clients().is_empty());
        assert_eq!(stats.snapshot().active_connections, 0);
    }

    #[tokio::test]
    async fn test_unpublish_releases_deleted_topic() {
        let (instance, stats) = setup();

        let inbound = frames(&[
            Message::Announce {
                name: "/p".into(),
                id: 0,
                pubuid: Some(2),
                value_type: ValueType::Int,
                properties: Properties::new(),
            },
            Message::Value {
                id: 2,
                timestamp: 10,
                value: Value::Int(1),
            },
            Message::Unannounce {
                name: "/p".into(),
                id: 0,
                pubuid: Some(2),
            },
        ]);
        let outbound = frames(&[
            Message::Announce {
                name: "/p".into(),
                id: 1,
                pubuid: Some(2),
                value_type: ValueType::Int,
                properties: Properties::new(),
            },
            Message::Unannounce {
                name: "/p".into(),
                id: 1,
                pubuid: None,
            },
        ]);

        let mock = Builder::new()
            .read(&hello(PROTOCOL_VERSION))
            .write(&hello_ack(1))
            .read(&inbound)
            .write(&outbound)
            .build();

        let mut conn = connection(mock, &instance, &stats);
        conn.run().await.unwrap();

        assert!(instance.get_value("/p").is_none());
        assert!(conn.announced.is_empty());
        assert!(conn.sent_sequences.is_empty());
    }
}

//! Local embedding API
//!
//! In-process clients of an [`Instance`]. A [`LocalClient`] is registered
//! like any network client, so its publishers and subscribers show up in
//! metadata and are released when it is dropped.
//!
//! Listener callbacks run on a dedicated thread per listener and never
//! while a table lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::PROTOCOL_VERSION;
use crate::registry::TopicInfo;
use crate::session::{ClientId, ClientInfo};
use crate::storage::SetOutcome;
use crate::subscription::{
    delivery_channel, DeliveryEvent, DeliveryReceiver, DeliverySender, SubscriberEntry, SubscriberOptions,
};
use crate::value::{Properties, PropertyUpdate, TimestampedValue, Value, ValueType};

use super::{ConnectionEvent, Instance};

/// Set of listener event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventKinds(u8);

impl EventKinds {
    pub const PUBLISH: EventKinds = EventKinds(0x01);
    pub const UNPUBLISH: EventKinds = EventKinds(0x02);
    pub const PROPERTIES: EventKinds = EventKinds(0x04);
    pub const VALUE: EventKinds = EventKinds(0x08);
    pub const TOPIC: EventKinds = EventKinds(0x07);
    pub const ALL: EventKinds = EventKinds(0x0F);

    pub fn contains(self, other: EventKinds) -> bool {
        self.0 & other.0 == other.0
    }

    /// Kind of a delivery
    pub fn of(event: &DeliveryEvent) -> EventKinds {
        match event {
            DeliveryEvent::Announced(_) => EventKinds::PUBLISH,
            DeliveryEvent::Unannounced { .. } => EventKinds::UNPUBLISH,
            DeliveryEvent::PropertiesChanged { .. } => EventKinds::PROPERTIES,
            DeliveryEvent::Value { .. } => EventKinds::VALUE,
        }
    }
}

impl std::ops::BitOr for EventKinds {
    type Output = EventKinds;

    fn bitor(self, rhs: EventKinds) -> EventKinds {
        EventKinds(self.0 | rhs.0)
    }
}

impl Instance {
    /// Register an in-process client
    pub fn local_client(self: &Arc<Self>, name: &str) -> LocalClient {
        let info = self.connect(name, None, PROTOCOL_VERSION);
        LocalClient {
            instance: Arc::clone(self),
            info,
            next_uid: AtomicU32::new(1),
            implicit: Mutex::new(HashMap::new()),
        }
    }
}

/// In-process client
pub struct LocalClient {
    instance: Arc<Instance>,
    info: ClientInfo,
    next_uid: AtomicU32,
    /// Publishers created by `set_value`, by topic name
    implicit: Mutex<HashMap<String, u32>>,
}

impl LocalClient {
    pub fn id(&self) -> ClientId {
        self.info.id
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    fn next_uid(&self) -> u32 {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    /// Start publishing a topic
    pub fn publish(&self, name: &str, value_type: ValueType) -> Result<Publisher> {
        self.publish_with(name, value_type, &Properties::new())
    }

    pub fn publish_with(
        &self,
        name: &str,
        value_type: ValueType,
        properties: &Properties,
    ) -> Result<Publisher> {
        let pubuid = self.next_uid();
        let topic = self
            .instance
            .publish(self.info.id, pubuid, name, value_type, properties)?;
        Ok(Publisher {
            instance: Arc::clone(&self.instance),
            client: self.info.id,
            pubuid,
            topic,
        })
    }

    /// Subscribe to a single pattern
    pub fn subscribe(&self, pattern: &str, options: SubscriberOptions) -> Result<Subscriber> {
        self.subscribe_all(&[pattern], options)
    }

    pub fn subscribe_all(&self, patterns: &[&str], options: SubscriberOptions) -> Result<Subscriber> {
        let (tx, rx) = delivery_channel();
        let guard = self.subscription(patterns, options, tx)?;
        Ok(Subscriber { guard, rx })
    }

    fn subscription(
        &self,
        patterns: &[&str],
        options: SubscriberOptions,
        sink: DeliverySender,
    ) -> Result<SubscriptionGuard> {
        let subuid = self.next_uid();
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        let entry = self
            .instance
            .subscribe(self.info.id, subuid, &patterns, options, sink)?;
        Ok(SubscriptionGuard {
            instance: Arc::clone(&self.instance),
            client: self.info.id,
            subuid,
            entry,
        })
    }

    pub fn get_value(&self, name: &str) -> Option<TimestampedValue> {
        self.instance.get_value(name)
    }

    /// Write a value at the current server time, publishing on first use
    pub fn set_value(&self, name: &str, value: impl Into<Value>) -> Result<SetOutcome> {
        self.set_value_at(name, value, 0)
    }

    pub fn set_value_at(&self, name: &str, value: impl Into<Value>, timestamp: i64) -> Result<SetOutcome> {
        let value = value.into();
        let existing = self.implicit.lock().get(name).copied();
        let pubuid = match existing {
            Some(pubuid) => pubuid,
            None => {
                let pubuid = self.next_uid();
                self.instance.publish(
                    self.info.id,
                    pubuid,
                    name,
                    value.value_type(),
                    &Properties::new(),
                )?;
                self.implicit.lock().insert(name.to_string(), pubuid);
                pubuid
            }
        };
        Ok(self.instance.set_value(self.info.id, pubuid, value, timestamp)?)
    }

    pub fn set_properties(&self, name: &str, update: &PropertyUpdate) -> Result<()> {
        Ok(self.instance.set_properties(name, update)?)
    }

    /// Call `callback` on a listener thread for matching topic events
    pub fn add_listener<F>(&self, patterns: &[&str], kinds: EventKinds, mut callback: F) -> Result<Listener>
    where
        F: FnMut(&DeliveryEvent) + Send + 'static,
    {
        let options = SubscriberOptions::new()
            .topics_only(!kinds.contains(EventKinds::VALUE))
            .send_all(kinds.contains(EventKinds::VALUE));

        let (tx, rx) = delivery_channel();
        spawn_listener(&self.thread_name(), rx, move |delivery| {
            if kinds.contains(EventKinds::of(&delivery.event)) {
                callback(&delivery.event);
            }
        })?;

        let guard = self.subscription(patterns, options, tx)?;
        Ok(Listener { _guard: guard })
    }

    /// Call `callback` on a listener thread when clients connect or
    /// disconnect; with `immediate`, current clients are reported first
    pub fn add_connection_listener<F>(&self, immediate: bool, mut callback: F) -> Result<ConnectionListener>
    where
        F: FnMut(&ConnectionEvent) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_listener(&self.thread_name(), rx, move |event| callback(&event))?;

        let id = self.instance.add_connection_sink(tx, immediate);
        Ok(ConnectionListener {
            instance: Arc::clone(&self.instance),
            id,
        })
    }

    fn thread_name(&self) -> String {
        format!("{}-listener", self.instance.config().server_name)
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        if let Err(e) = self.instance.disconnect(self.info.id) {
            tracing::debug!(client_id = self.info.id, error = %e, "Local client already gone");
        }
    }
}

fn spawn_listener<T, F>(name: &str, mut rx: mpsc::UnboundedReceiver<T>, mut f: F) -> std::io::Result<()>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    // Exits once every sender is dropped
    thread::Builder::new().name(name.to_string()).spawn(move || {
        while let Some(item) = rx.blocking_recv() {
            f(item);
        }
    })?;
    Ok(())
}

/// Publishing handle; unpublishes on drop
pub struct Publisher {
    instance: Arc<Instance>,
    client: ClientId,
    pubuid: u32,
    topic: TopicInfo,
}

impl Publisher {
    pub fn topic(&self) -> &TopicInfo {
        &self.topic
    }

    /// Write at the current server time
    pub fn set(&self, value: impl Into<Value>) -> Result<SetOutcome> {
        self.set_at(value, 0)
    }

    pub fn set_at(&self, value: impl Into<Value>, timestamp: i64) -> Result<SetOutcome> {
        Ok(self
            .instance
            .set_value(self.client, self.pubuid, value.into(), timestamp)?)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Err(e) = self.instance.unpublish(self.client, self.pubuid) {
            tracing::debug!(topic = %self.topic.name, error = %e, "Publisher already released");
        }
    }
}

struct SubscriptionGuard {
    instance: Arc<Instance>,
    client: ClientId,
    subuid: u32,
    entry: Arc<SubscriberEntry>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.instance.unsubscribe(self.client, self.subuid) {
            tracing::debug!(client_id = self.client, subuid = self.subuid, error = %e, "Subscriber already released");
        }
    }
}

/// Subscription handle with its delivery queue; unsubscribes on drop
pub struct Subscriber {
    guard: SubscriptionGuard,
    rx: DeliveryReceiver,
}

impl Subscriber {
    pub fn uid(&self) -> u32 {
        self.guard.subuid
    }

    /// Release coalesced values whose period has elapsed into the queue
    fn release_pending(&self) {
        if self.guard.entry.options.is_rate_limited() {
            self.guard.entry.flush(Instant::now());
        }
    }

    /// Next queued event, if any
    pub fn try_recv(&mut self) -> Option<DeliveryEvent> {
        self.release_pending();
        self.rx.try_recv().ok().map(|d| d.event)
    }

    /// Wait for the next event
    ///
    /// Rate-limited subscribers wake once per period to release the last
    /// value of a burst.
    pub async fn recv(&mut self) -> Option<DeliveryEvent> {
        let period = self.guard.entry.options.periodic;
        if period.is_zero() {
            return self.rx.recv().await.map(|d| d.event);
        }

        loop {
            self.release_pending();
            tokio::select! {
                delivery = self.rx.recv() => return delivery.map(|d| d.event),
                _ = tokio::time::sleep(period) => {}
            }
        }
    }

    /// Every queued event
    pub fn read_queue(&mut self) -> Vec<DeliveryEvent> {
        self.release_pending();
        let mut events = Vec::new();
        while let Ok(delivery) = self.rx.try_recv() {
            events.push(delivery.event);
        }
        events
    }

    /// Queued values only
    pub fn read_values(&mut self) -> Vec<(Arc<str>, TimestampedValue)> {
        self.read_queue()
            .into_iter()
            .filter_map(|event| match event {
                DeliveryEvent::Value { name, value, .. } => Some((name, value)),
                _ => None,
            })
            .collect()
    }
}

/// Topic listener handle; stops the listener on drop
pub struct Listener {
    _guard: SubscriptionGuard,
}

/// Connection listener handle; stops the listener on drop
pub struct ConnectionListener {
    instance: Arc<Instance>,
    id: u64,
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.instance.remove_connection_sink(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use crate::instance::InstanceConfig;

    fn instance() -> Arc<Instance> {
        Arc::new(Instance::new(InstanceConfig::new().meta_topics(false)))
    }

    #[test]
    fn test_publish_and_subscribe() {
        let inst = instance();
        let writer = inst.local_client("writer");
        let reader = inst.local_client("reader");

        let mut sub = reader.subscribe("/drive/*", SubscriberOptions::default()).unwrap();
        let speed = writer.publish("/drive/speed", ValueType::Double).unwrap();
        speed.set_at(1.5, 10).unwrap();
        speed.set_at(2.5, 20).unwrap();

        let values: Vec<f64> = sub
            .read_values()
            .iter()
            .filter_map(|(_, v)| v.value.as_f64())
            .collect();
        assert_eq!(values, vec![1.5, 2.5]);
        assert_eq!(reader.get_value("/drive/speed").unwrap().timestamp, 20);
    }

    #[test]
    fn test_rate_limited_subscriber_gets_last_of_burst() {
        let inst = instance();
        let writer = inst.local_client("writer");
        let reader = inst.local_client("reader");

        let options = SubscriberOptions::new().periodic(Duration::from_millis(20));
        let mut sub = reader.subscribe("/burst", options).unwrap();
        let publisher = writer.publish("/burst", ValueType::Int).unwrap();
        for i in 1..=5i64 {
            publisher.set_at(i, i).unwrap();
        }

        thread::sleep(Duration::from_millis(40));
        let values: Vec<i64> = sub
            .read_values()
            .iter()
            .filter_map(|(_, v)| v.value.as_i64())
            .collect();
        assert_eq!(values, vec![1, 5]);
    }

    #[tokio::test]
    async fn test_rate_limited_recv_releases_pending() {
        let inst = instance();
        let writer = inst.local_client("writer");
        let reader = inst.local_client("reader");

        let options = SubscriberOptions::new().periodic(Duration::from_millis(20));
        let mut sub = reader.subscribe("/burst", options).unwrap();
        let publisher = writer.publish("/burst", ValueType::Int).unwrap();
        for i in 1..=3i64 {
            publisher.set_at(i, i).unwrap();
        }

        let mut values = Vec::new();
        while values.last() != Some(&3) {
            let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
                .await
                .unwrap()
                .unwrap();
            if let DeliveryEvent::Value { value, .. } = event {
                values.push(value.value.as_i64().unwrap());
            }
        }
        assert_eq!(values, vec![1, 3]);
    }

    #[test]
    fn test_implicit_publish_on_set_value() {
        let inst = instance();
        let client = inst.local_client("c");

        client.set_value("/x", 5i64).unwrap();
        client.set_value("/x", 6i64).unwrap();
        assert_eq!(inst.registry().publisher_count("/x"), 1);
        assert_eq!(client.get_value("/x").unwrap().value, Value::Int(6));

        // Type is fixed by the first write
        assert!(client.set_value("/x", "text").is_err());
    }

    #[test]
    fn test_drop_releases_handles() {
        let inst = instance();
        let client = inst.local_client("c");

        let publisher = client.publish("/t", ValueType::Boolean).unwrap();
        let subscriber = client.subscribe("/t", SubscriberOptions::default()).unwrap();
        assert_eq!(inst.engine().len(), 1);

        drop(subscriber);
        assert!(inst.engine().is_empty());

        drop(publisher);
        assert!(inst.topic("/t").is_err());

        client.set_value("/u", true).unwrap();
        drop(client);
        assert!(inst.topic("/u").is_err());
        assert!(inst.clients().is_empty());
    }

    #[test]
    fn test_listener_runs_on_its_own_thread() {
        let inst = instance();
        let client = inst.local_client("c");
        let (tx, rx) = std_mpsc::channel();

        let _listener = client
            .add_listener(&["/l"], EventKinds::PUBLISH | EventKinds::VALUE, move |event| {
                let thread = thread::current().name().map(String::from);
                let _ = tx.send((EventKinds::of(event), thread));
            })
            .unwrap();

        client.set_value("/l", 1i64).unwrap();

        let (kind, thread) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(kind, EventKinds::PUBLISH);
        assert_eq!(thread.as_deref(), Some("nettables-listener"));

        let (kind, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(kind, EventKinds::VALUE);
    }

    #[test]
    fn test_topic_only_listener_skips_values() {
        let inst = instance();
        let client = inst.local_client("c");
        let (tx, rx) = std_mpsc::channel();

        let _listener = client
            .add_listener(&["/l"], EventKinds::TOPIC, move |event| {
                let _ = tx.send(EventKinds::of(event));
            })
            .unwrap();

        let publisher = client.publish("/l", ValueType::Int).unwrap();
        publisher.set(1i64).unwrap();
        drop(publisher);

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), EventKinds::PUBLISH);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), EventKinds::UNPUBLISH);
    }

    #[test]
    fn test_connection_listener() {
        let inst = instance();
        let watcher = inst.local_client("watcher");
        let (tx, rx) = std_mpsc::channel();

        let listener = watcher
            .add_connection_listener(true, move |event| {
                let _ = tx.send(event.clone());
            })
            .unwrap();

        let other = inst.local_client("other");
        drop(other);

        let names: Vec<(bool, String)> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .map(|e| (matches!(e, ConnectionEvent::Connected(_)), e.info().name.clone()))
            .collect();
        assert_eq!(
            names,
            vec![
                (true, "watcher".to_string()),
                (true, "other".to_string()),
                (false, "other".to_string()),
            ]
        );

        drop(listener);
        let _late = inst.local_client("late");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_event_kinds() {
        let kinds = EventKinds::PUBLISH | EventKinds::VALUE;
        assert!(kinds.contains(EventKinds::VALUE));
        assert!(!kinds.contains(EventKinds::UNPUBLISH));
        assert!(EventKinds::ALL.contains(EventKinds::TOPIC));
    }
}

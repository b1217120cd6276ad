//! Subscription engine
//!
//! Matches subscribers to topics and enqueues deliveries.
//!
//! # Ordering
//!
//! The instance calls [`SubscriptionEngine::on_value`] from inside the value
//! store's per-topic write lock, so for one topic the engine sees values in
//! write order. Each subscriber additionally keeps the last delivered sequence
//! per topic and ignores anything not newer, which suppresses duplicates
//! between catch-up values and live updates.
//!
//! # Rate limiting
//!
//! For subscribers with a non-zero `periodic`, the first value after a quiet
//! period is delivered immediately. Values arriving before the period has
//! elapsed replace each other in a single pending slot, and the pending value
//! is delivered by [`SubscriptionEngine::flush_due`] once the period is over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::registry::{RegistryError, TopicEvent, TopicId, TopicInfo};
use crate::session::ClientId;
use crate::value::{TimestampedValue, Value};

use super::delivery::{Delivery, DeliveryEvent, DeliverySender, SubscriberId};
use super::options::SubscriberOptions;
use super::pattern::TopicPattern;

/// Per-topic delivery cursor of one subscriber
#[derive(Debug, Default)]
struct TopicCursor {
    last_sequence: u64,
    last_value: Option<Value>,
    last_sent: Option<Instant>,
    pending: Option<(Arc<str>, TimestampedValue)>,
}

/// A registered subscriber
#[derive(Debug)]
pub struct SubscriberEntry {
    /// Engine-wide id
    pub id: SubscriberId,

    /// Owning client
    pub owner: ClientId,

    /// Client-chosen subscriber uid
    pub uid: u32,

    pub patterns: Vec<TopicPattern>,

    pub options: SubscriberOptions,

    sink: DeliverySender,

    /// Matched topics and their cursors
    matched: Mutex<HashMap<TopicId, TopicCursor>>,
}

impl SubscriberEntry {
    /// Whether any pattern matches the topic name
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    /// Whether the topic is currently in the matched set
    pub fn is_matched(&self, id: TopicId) -> bool {
        self.matched.lock().contains_key(&id)
    }

    /// Matched topic ids, ascending
    pub fn matched_topics(&self) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = self.matched.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Source form of the patterns
    pub fn pattern_strings(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.to_string()).collect()
    }

    fn send(&self, event: DeliveryEvent) -> bool {
        let delivered = self
            .sink
            .send(Delivery {
                subscriber: self.id,
                event,
            })
            .is_ok();
        if !delivered {
            tracing::trace!(subscriber = self.id, "Delivery queue closed");
        }
        delivered
    }

    /// Add a topic to the matched set if the patterns match
    ///
    /// Returns true if the topic was newly matched (and announced).
    pub fn match_topic(&self, topic: &TopicInfo) -> bool {
        if !self.matches(&topic.name) {
            return false;
        }
        // Enqueued under the lock so no value of the topic can overtake it
        let mut matched = self.matched.lock();
        if matched.contains_key(&topic.id) {
            return false;
        }
        matched.insert(topic.id, TopicCursor::default());
        self.send(DeliveryEvent::Announced(topic.clone()))
    }

    /// Remove a topic from the matched set, delivering `Unannounced`
    pub(crate) fn unmatch_topic(&self, id: TopicId, name: &Arc<str>) -> bool {
        let mut matched = self.matched.lock();
        if matched.remove(&id).is_none() {
            return false;
        }
        self.send(DeliveryEvent::Unannounced {
            id,
            name: Arc::clone(name),
        })
    }

    /// Offer a value of a matched topic
    ///
    /// Returns true if a delivery was enqueued now. Values of unmatched
    /// topics, duplicates and (for `changes_only`) unchanged values are
    /// ignored; rate-limited values may be held back for `flush`.
    pub fn offer(&self, id: TopicId, name: &Arc<str>, value: &TimestampedValue, now: Instant) -> bool {
        if self.options.topics_only {
            return false;
        }

        let mut matched = self.matched.lock();
        let Some(cursor) = matched.get_mut(&id) else {
            return false;
        };

        let newest_seen = cursor
            .pending
            .as_ref()
            .map(|(_, p)| p.sequence)
            .unwrap_or(cursor.last_sequence);
        if value.sequence <= newest_seen {
            return false;
        }

        if self.options.changes_only && cursor.last_value.as_ref() == Some(&value.value) {
            cursor.last_sequence = value.sequence;
            cursor.pending = None;
            return false;
        }

        let period = self.options.periodic;
        let quiet = cursor
            .last_sent
            .map(|sent| now.saturating_duration_since(sent) >= period)
            .unwrap_or(true);

        if period.is_zero() || (quiet && cursor.pending.is_none()) {
            cursor.last_sequence = value.sequence;
            cursor.last_sent = Some(now);
            if self.options.changes_only {
                cursor.last_value = Some(value.value.clone());
            }
            return self.send(DeliveryEvent::Value {
                id,
                name: Arc::clone(name),
                value: value.clone(),
            });
        }

        cursor.pending = Some((Arc::clone(name), value.clone()));
        false
    }

    /// Deliver pending rate-limited values whose period has elapsed
    pub(crate) fn flush(&self, now: Instant) -> usize {
        let period = self.options.periodic;
        let mut delivered = 0;

        let mut matched = self.matched.lock();
        for (id, cursor) in matched.iter_mut() {
            let elapsed = cursor
                .last_sent
                .map(|sent| now.saturating_duration_since(sent) >= period)
                .unwrap_or(true);
            if !elapsed {
                continue;
            }
            if let Some((name, value)) = cursor.pending.take() {
                cursor.last_sequence = value.sequence;
                cursor.last_sent = Some(now);
                if self.options.changes_only {
                    cursor.last_value = Some(value.value.clone());
                }
                if self.send(DeliveryEvent::Value {
                    id: *id,
                    name,
                    value,
                }) {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// Registry of subscribers and the fan-out logic
pub struct SubscriptionEngine {
    subscribers: RwLock<HashMap<SubscriberId, Arc<SubscriberEntry>>>,
    next_id: AtomicU64,
}

impl SubscriptionEngine {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber
    ///
    /// The subscriber starts with an empty matched set; the caller matches
    /// existing topics with [`SubscriberEntry::match_topic`] afterwards so
    /// topics created meanwhile are not missed.
    pub fn subscribe(
        &self,
        owner: ClientId,
        uid: u32,
        patterns: &[String],
        options: SubscriberOptions,
        sink: DeliverySender,
    ) -> Arc<SubscriberEntry> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let patterns = patterns
            .iter()
            .map(|p| TopicPattern::parse(p, options.prefix_match))
            .collect();

        let entry = Arc::new(SubscriberEntry {
            id,
            owner,
            uid,
            patterns,
            options,
            sink,
            matched: Mutex::new(HashMap::new()),
        });

        self.subscribers.write().insert(id, Arc::clone(&entry));

        tracing::debug!(
            subscriber = id,
            client_id = owner,
            uid = uid,
            patterns = ?entry.pattern_strings(),
            "Subscriber added"
        );

        entry
    }

    /// Remove a subscriber
    ///
    /// Deliveries already enqueued stay in the subscriber's queue.
    pub fn unsubscribe(&self, id: SubscriberId) -> Result<Arc<SubscriberEntry>, RegistryError> {
        let entry = self
            .subscribers
            .write()
            .remove(&id)
            .ok_or(RegistryError::SubscriberNotFound(id))?;

        tracing::debug!(subscriber = id, client_id = entry.owner, "Subscriber removed");
        Ok(entry)
    }

    /// Re-evaluate matching after a registry change
    ///
    /// Returns the number of deliveries enqueued.
    pub fn on_topic_event(&self, event: &TopicEvent) -> usize {
        let subscribers = self.subscribers.read();
        let mut delivered = 0;

        for entry in subscribers.values() {
            let sent = match event {
                TopicEvent::Announced(topic) => entry.match_topic(topic),
                TopicEvent::Unannounced { id, name } => entry.unmatch_topic(*id, name),
                TopicEvent::PropertiesChanged { topic, update } => {
                    entry.is_matched(topic.id)
                        && entry.send(DeliveryEvent::PropertiesChanged {
                            topic: topic.clone(),
                            update: update.clone(),
                        })
                }
            };
            if sent {
                delivered += 1;
            }
        }

        delivered
    }

    /// Fan a stored value out to matching subscribers
    ///
    /// Returns the number of deliveries enqueued immediately.
    pub fn on_value(
        &self,
        id: TopicId,
        name: &Arc<str>,
        value: &TimestampedValue,
        now: Instant,
    ) -> usize {
        self.subscribers
            .read()
            .values()
            .filter(|entry| entry.offer(id, name, value, now))
            .count()
    }

    /// Deliver rate-limited values whose period has elapsed
    pub fn flush_due(&self, now: Instant) -> usize {
        let entries: Vec<Arc<SubscriberEntry>> = self
            .subscribers
            .read()
            .values()
            .filter(|e| e.options.is_rate_limited())
            .cloned()
            .collect();

        entries.iter().map(|e| e.flush(now)).sum()
    }

    pub fn get(&self, id: SubscriberId) -> Option<Arc<SubscriberEntry>> {
        self.subscribers.read().get(&id).cloned()
    }

    /// Subscribers owned by a client, by uid
    pub fn subscribers_of(&self, owner: ClientId) -> Vec<Arc<SubscriberEntry>> {
        let mut entries: Vec<_> = self
            .subscribers
            .read()
            .values()
            .filter(|e| e.owner == owner)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.uid);
        entries
    }

    /// Subscribers whose matched set contains a topic, by id
    pub fn subscribers_matching(&self, topic: TopicId) -> Vec<Arc<SubscriberEntry>> {
        let mut entries: Vec<_> = self
            .subscribers
            .read()
            .values()
            .filter(|e| e.is_matched(topic))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}

impl Default for SubscriptionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::subscription::delivery::{delivery_channel, DeliveryReceiver};
    use crate::value::{Properties, ValueType};

    fn topic(id: TopicId, name: &str) -> TopicInfo {
        TopicInfo {
            id,
            name: Arc::from(name),
            value_type: ValueType::Int,
            properties: Properties::new(),
        }
    }

    fn value(v: i64, sequence: u64) -> TimestampedValue {
        TimestampedValue::new(Value::Int(v), v, sequence)
    }

    fn drain(rx: &mut DeliveryReceiver) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            events.push(delivery.event);
        }
        events
    }

    fn values(events: &[DeliveryEvent]) -> Vec<i64> {
        events
            .iter()
            .filter_map(|e| match e {
                DeliveryEvent::Value { value, .. } => value.value.as_i64(),
                _ => None,
            })
            .collect()
    }

    fn subscribe(
        engine: &SubscriptionEngine,
        pattern: &str,
        options: SubscriberOptions,
    ) -> (Arc<SubscriberEntry>, DeliveryReceiver) {
        let (tx, rx) = delivery_channel();
        let entry = engine.subscribe(1, 1, &[pattern.to_string()], options, tx);
        (entry, rx)
    }

    #[test]
    fn test_prefix_subscriber_receives_matching_topics() {
        let engine = SubscriptionEngine::new();
        let (_entry, mut rx) = subscribe(&engine, "/a/*", SubscriberOptions::default());

        let ab = topic(1, "/a/b");
        let ac = topic(2, "/a/c");
        let ba = topic(3, "/b/a");
        for t in [&ab, &ac, &ba] {
            engine.on_topic_event(&TopicEvent::Announced(t.clone()));
        }

        let now = Instant::now();
        engine.on_value(ab.id, &ab.name, &value(1, 1), now);
        engine.on_value(ac.id, &ac.name, &value(2, 1), now);
        engine.on_value(ba.id, &ba.name, &value(3, 1), now);

        let events = drain(&mut rx);
        let names: Vec<&str> = events.iter().map(|e| e.topic_name()).collect();
        assert_eq!(names, vec!["/a/b", "/a/c", "/a/b", "/a/c"]);
        assert_eq!(values(&events), vec![1, 2]);
    }

    #[test]
    fn test_per_topic_fifo() {
        let engine = SubscriptionEngine::new();
        let (_entry, mut rx) = subscribe(&engine, "/t", SubscriberOptions::default());
        let t = topic(1, "/t");
        engine.on_topic_event(&TopicEvent::Announced(t.clone()));

        let now = Instant::now();
        for seq in 1..=5 {
            engine.on_value(t.id, &t.name, &value(seq as i64 * 10, seq), now);
        }

        assert_eq!(values(&drain(&mut rx)), vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_duplicate_sequence_suppressed() {
        let engine = SubscriptionEngine::new();
        let (entry, mut rx) = subscribe(&engine, "/t", SubscriberOptions::default());
        let t = topic(1, "/t");
        entry.match_topic(&t);

        let now = Instant::now();
        assert!(entry.offer(t.id, &t.name, &value(1, 1), now));
        assert!(!entry.offer(t.id, &t.name, &value(1, 1), now));
        assert_eq!(values(&drain(&mut rx)), vec![1]);
    }

    #[test]
    fn test_rate_limited_coalesces_to_latest() {
        let engine = SubscriptionEngine::new();
        let period = Duration::from_millis(100);
        let (_entry, mut rx) = subscribe(&engine, "/t", SubscriberOptions::new().periodic(period));
        let t = topic(1, "/t");
        engine.on_topic_event(&TopicEvent::Announced(t.clone()));
        drain(&mut rx);

        let start = Instant::now();
        // Burst: first goes out at once, the rest coalesce
        for seq in 1..=5u64 {
            engine.on_value(t.id, &t.name, &value(seq as i64, seq), start);
        }
        assert_eq!(values(&drain(&mut rx)), vec![1]);

        // Not due yet
        assert_eq!(engine.flush_due(start + Duration::from_millis(50)), 0);
        assert!(drain(&mut rx).is_empty());

        // Period elapsed: last value of the burst is delivered
        assert_eq!(engine.flush_due(start + period), 1);
        assert_eq!(values(&drain(&mut rx)), vec![5]);

        // Nothing left pending
        assert_eq!(engine.flush_due(start + period * 3), 0);
    }

    #[test]
    fn test_rate_limited_quiet_value_is_immediate() {
        let engine = SubscriptionEngine::new();
        let period = Duration::from_millis(100);
        let (_entry, mut rx) = subscribe(&engine, "/t", SubscriberOptions::new().periodic(period));
        let t = topic(1, "/t");
        engine.on_topic_event(&TopicEvent::Announced(t.clone()));

        let start = Instant::now();
        engine.on_value(t.id, &t.name, &value(1, 1), start);
        engine.on_value(t.id, &t.name, &value(2, 2), start + period * 2);

        assert_eq!(values(&drain(&mut rx)), vec![1, 2]);
    }

    #[test]
    fn test_changes_only() {
        let engine = SubscriptionEngine::new();
        let (_entry, mut rx) = subscribe(&engine, "/t", SubscriberOptions::new().changes_only(true));
        let t = topic(1, "/t");
        engine.on_topic_event(&TopicEvent::Announced(t.clone()));

        let now = Instant::now();
        let same = |seq| TimestampedValue::new(Value::Int(7), seq as i64, seq);
        engine.on_value(t.id, &t.name, &same(1), now);
        engine.on_value(t.id, &t.name, &same(2), now);
        engine.on_value(t.id, &t.name, &value(8, 3), now);

        assert_eq!(values(&drain(&mut rx)), vec![7, 8]);
    }

    #[test]
    fn test_topics_only_gets_no_values() {
        let engine = SubscriptionEngine::new();
        let (_entry, mut rx) = subscribe(&engine, "/t", SubscriberOptions::new().topics_only(true));
        let t = topic(1, "/t");
        engine.on_topic_event(&TopicEvent::Announced(t.clone()));
        engine.on_value(t.id, &t.name, &value(1, 1), Instant::now());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DeliveryEvent::Announced(_)));
    }

    #[test]
    fn test_unannounce_and_properties() {
        let engine = SubscriptionEngine::new();
        let (entry, mut rx) = subscribe(&engine, "/t", SubscriberOptions::default());
        let t = topic(1, "/t");
        engine.on_topic_event(&TopicEvent::Announced(t.clone()));
        engine.on_topic_event(&TopicEvent::PropertiesChanged {
            topic: t.clone(),
            update: Default::default(),
        });
        engine.on_topic_event(&TopicEvent::Unannounced {
            id: t.id,
            name: Arc::clone(&t.name),
        });

        let events = drain(&mut rx);
        assert!(matches!(events[0], DeliveryEvent::Announced(_)));
        assert!(matches!(events[1], DeliveryEvent::PropertiesChanged { .. }));
        assert!(matches!(events[2], DeliveryEvent::Unannounced { .. }));
        assert!(!entry.is_matched(t.id));

        // Values of an unannounced topic go nowhere
        engine.on_value(t.id, &t.name, &value(1, 1), Instant::now());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_unsubscribe_keeps_enqueued_deliveries() {
        let engine = SubscriptionEngine::new();
        let (entry, mut rx) = subscribe(&engine, "/t", SubscriberOptions::default());
        let t = topic(1, "/t");
        engine.on_topic_event(&TopicEvent::Announced(t.clone()));
        engine.on_value(t.id, &t.name, &value(1, 1), Instant::now());

        engine.unsubscribe(entry.id).unwrap();
        engine.on_value(t.id, &t.name, &value(2, 2), Instant::now());

        assert_eq!(values(&drain(&mut rx)), vec![1]);
        assert!(matches!(
            engine.unsubscribe(entry.id),
            Err(RegistryError::SubscriberNotFound(_))
        ));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_announce_precedes_concurrent_values() {
        use std::sync::atomic::AtomicBool;
        use std::thread;

        let engine = Arc::new(SubscriptionEngine::new());
        let t = topic(1, "/race");
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            let t = t.clone();
            thread::spawn(move || {
                let mut sequence = 0;
                while !stop.load(Ordering::Relaxed) {
                    sequence += 1;
                    engine.on_value(t.id, &t.name, &value(sequence as i64, sequence), Instant::now());
                }
            })
        };

        for _ in 0..500 {
            let (entry, mut rx) = subscribe(&engine, "/race", SubscriberOptions::default());
            entry.match_topic(&t);
            thread::yield_now();
            entry.unmatch_topic(t.id, &t.name);
            engine.unsubscribe(entry.id).unwrap();

            let events = drain(&mut rx);
            assert!(matches!(events.first(), Some(DeliveryEvent::Announced(_))));
            assert!(matches!(events.last(), Some(DeliveryEvent::Unannounced { .. })));
            assert!(events.iter().all(|e| e.topic_id() == t.id));
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }

    #[test]
    fn test_lookup_helpers() {
        let engine = SubscriptionEngine::new();
        let (tx, _rx) = delivery_channel();
        let second = engine.subscribe(5, 2, &["/x".to_string()], SubscriberOptions::default(), tx.clone());
        let first = engine.subscribe(5, 1, &["/*".to_string()], SubscriberOptions::default(), tx);

        let owned: Vec<u32> = engine.subscribers_of(5).iter().map(|e| e.uid).collect();
        assert_eq!(owned, vec![1, 2]);

        let x = topic(9, "/x");
        engine.on_topic_event(&TopicEvent::Announced(x.clone()));
        let matching: Vec<_> = engine.subscribers_matching(9).iter().map(|e| e.id).collect();
        assert_eq!(matching, vec![second.id, first.id]);
        assert_eq!(first.pattern_strings(), vec!["/*".to_string()]);
    }
}

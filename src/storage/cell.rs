//! Versioned value cell
//!
//! One cell per topic. The cell holds an `Arc` to the current value; a write
//! builds the new value first and then swaps the pointer, so readers always
//! see either the old or the new value in full.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::{TimestampedValue, Value};

/// Outcome of a write
#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    /// The value replaced the previous one
    Stored(TimestampedValue),
    /// The value was older than the stored one and was dropped
    Stale,
}

impl SetOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, SetOutcome::Stored(_))
    }
}

/// Latest value of a single topic
#[derive(Debug, Default)]
pub struct VersionedCell {
    slot: RwLock<Option<Arc<TimestampedValue>>>,
}

impl VersionedCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, if any
    pub fn load(&self) -> Option<Arc<TimestampedValue>> {
        self.slot.read().clone()
    }

    /// Write a value under last-write-wins
    ///
    /// A timestamp strictly older than the stored one is dropped. Equal
    /// timestamps are accepted, so the most recent arrival wins. `on_stored`
    /// runs while the cell is still locked, which orders anything it does
    /// exactly like the writes themselves.
    pub fn store_with<F>(&self, value: Value, timestamp: i64, on_stored: F) -> SetOutcome
    where
        F: FnOnce(&TimestampedValue),
    {
        let mut slot = self.slot.write();

        let sequence = match slot.as_ref() {
            Some(current) if timestamp < current.timestamp => return SetOutcome::Stale,
            Some(current) => current.sequence + 1,
            None => 1,
        };

        let stored = Arc::new(TimestampedValue::new(value, timestamp, sequence));
        *slot = Some(Arc::clone(&stored));
        on_stored(&stored);

        SetOutcome::Stored((*stored).clone())
    }

    /// Run `f` with the current value while holding the read lock
    ///
    /// Writers are excluded for the duration, so nothing `f` observes can be
    /// overtaken by a concurrent write's `on_stored` callback.
    pub fn read_with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Option<&TimestampedValue>) -> R,
    {
        let slot = self.slot.read();
        f(slot.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_increases_on_store() {
        let cell = VersionedCell::new();
        assert!(cell.load().is_none());

        let first = cell.store_with(Value::Int(1), 10, |_| {});
        let second = cell.store_with(Value::Int(2), 20, |_| {});

        match (first, second) {
            (SetOutcome::Stored(a), SetOutcome::Stored(b)) => {
                assert_eq!(a.sequence, 1);
                assert_eq!(b.sequence, 2);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_older_timestamp_is_stale() {
        let cell = VersionedCell::new();
        cell.store_with(Value::Int(1), 100, |_| {});

        let mut called = false;
        let outcome = cell.store_with(Value::Int(2), 99, |_| called = true);
        assert_eq!(outcome, SetOutcome::Stale);
        assert!(!called);
        assert_eq!(cell.load().unwrap().value, Value::Int(1));
    }

    #[test]
    fn test_equal_timestamp_latest_arrival_wins() {
        let cell = VersionedCell::new();
        cell.store_with(Value::Int(1), 100, |_| {});
        let outcome = cell.store_with(Value::Int(2), 100, |_| {});

        assert!(outcome.is_stored());
        assert_eq!(cell.load().unwrap().value, Value::Int(2));
    }

    #[test]
    fn test_read_with_sees_current() {
        let cell = VersionedCell::new();
        assert!(cell.read_with(|v| v.is_none()));
        cell.store_with(Value::Boolean(true), 5, |_| {});
        assert_eq!(cell.read_with(|v| v.map(|v| v.timestamp)), Some(5));
    }
}

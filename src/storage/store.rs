//! Value store
//!
//! Latest timestamped value per topic, keyed by topic id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::registry::{RegistryError, TopicId, TopicInfo};
use crate::value::{TimestampedValue, Value};

use super::cell::{SetOutcome, VersionedCell};

/// Store of the latest value of every topic
///
/// The cell map is write-locked only when a topic receives its first value or
/// is deleted; writes to existing topics lock just their own cell.
#[derive(Default)]
pub struct ValueStore {
    cells: RwLock<HashMap<TopicId, Arc<VersionedCell>>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, id: TopicId) -> Option<Arc<VersionedCell>> {
        self.cells.read().get(&id).cloned()
    }

    fn cell_or_insert(&self, id: TopicId) -> Arc<VersionedCell> {
        if let Some(cell) = self.cell(id) {
            return cell;
        }
        Arc::clone(self.cells.write().entry(id).or_default())
    }

    /// Store a value for a topic
    ///
    /// Fails with `TypeMismatch` if the value does not have the topic's
    /// declared type. Older timestamps yield `SetOutcome::Stale`.
    pub fn set(
        &self,
        topic: &TopicInfo,
        value: Value,
        timestamp: i64,
    ) -> Result<SetOutcome, RegistryError> {
        self.update(topic, value, timestamp, |_| {})
    }

    /// Store a value and run `on_stored` while the topic's cell is locked
    pub fn update<F>(
        &self,
        topic: &TopicInfo,
        value: Value,
        timestamp: i64,
        on_stored: F,
    ) -> Result<SetOutcome, RegistryError>
    where
        F: FnOnce(&TimestampedValue),
    {
        let requested = value.value_type();
        if requested != topic.value_type {
            return Err(RegistryError::TypeMismatch {
                name: topic.name.to_string(),
                existing: topic.value_type,
                requested,
            });
        }

        let outcome = self
            .cell_or_insert(topic.id)
            .store_with(value, timestamp, on_stored);

        if outcome == SetOutcome::Stale {
            tracing::trace!(topic = %topic.name, timestamp = timestamp, "Stale value dropped");
        }

        Ok(outcome)
    }

    /// Latest value of a topic
    pub fn get(&self, id: TopicId) -> Option<TimestampedValue> {
        self.cell(id)?.load().map(|v| (*v).clone())
    }

    /// Run `f` with a topic's current value, excluding writers meanwhile
    pub fn read_with<F, R>(&self, id: TopicId, f: F) -> R
    where
        F: FnOnce(Option<&TimestampedValue>) -> R,
    {
        match self.cell(id) {
            Some(cell) => cell.read_with(f),
            None => f(None),
        }
    }

    /// Drop a deleted topic's value
    pub fn remove(&self, id: TopicId) -> Option<TimestampedValue> {
        let cell = self.cells.write().remove(&id)?;
        cell.load().map(|v| (*v).clone())
    }

    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }
}

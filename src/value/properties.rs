//! Topic properties
//!
//! Properties are a string-keyed map of typed values attached to a topic.
//! Two keys have meaning to the table itself:
//!
//! - `persistent`: the topic survives its last publisher (and would be saved
//!   by an external persistence collaborator)
//! - `retained`: the topic survives its last publisher

use std::collections::BTreeMap;

use super::types::Value;

/// Property key marking a topic as persistent
pub const PERSISTENT: &str = "persistent";

/// Property key marking a topic as retained
pub const RETAINED: &str = "retained";

/// A partial property update; `None` deletes the key
pub type PropertyUpdate = BTreeMap<String, Option<Value>>;

/// Topic properties
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    entries: BTreeMap<String, Value>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Properties with only `retained = true`
    pub fn retained() -> Self {
        Self::new().with(RETAINED, true)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    fn flag(&self, key: &str) -> bool {
        self.entries.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn is_persistent(&self) -> bool {
        self.flag(PERSISTENT)
    }

    pub fn is_retained(&self) -> bool {
        self.flag(RETAINED)
    }

    /// Whether a topic with these properties outlives its publishers
    pub fn keeps_topic(&self) -> bool {
        self.is_retained() || self.is_persistent()
    }

    /// Merge every entry of `other` into `self`
    ///
    /// Returns the update that was actually applied (keys whose value changed).
    pub fn merge(&mut self, other: &Properties) -> PropertyUpdate {
        let mut applied = PropertyUpdate::new();
        for (key, value) in &other.entries {
            if self.entries.get(key) != Some(value) {
                self.entries.insert(key.clone(), value.clone());
                applied.insert(key.clone(), Some(value.clone()));
            }
        }
        applied
    }

    /// Apply a partial update
    ///
    /// Returns the subset of the update that changed something.
    pub fn apply(&mut self, update: &PropertyUpdate) -> PropertyUpdate {
        let mut applied = PropertyUpdate::new();
        for (key, value) in update {
            match value {
                Some(v) => {
                    if self.entries.get(key) != Some(v) {
                        self.entries.insert(key.clone(), v.clone());
                        applied.insert(key.clone(), Some(v.clone()));
                    }
                }
                None => {
                    if self.entries.remove(key).is_some() {
                        applied.insert(key.clone(), None);
                    }
                }
            }
        }
        applied
    }
}

impl FromIterator<(String, Value)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

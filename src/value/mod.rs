//! Value model
//!
//! Typed payloads, their timestamps and per-topic properties.

pub mod properties;
pub mod types;

pub use properties::{Properties, PropertyUpdate};
pub use types::{TimestampedValue, Value, ValueType};

//! Value storage
//!
//! Versioned, timestamped storage of the latest value per topic under a
//! last-write-wins policy. Ties on timestamp go to the most recent arrival.

pub mod cell;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

pub use cell::{SetOutcome, VersionedCell};
pub use store::ValueStore;

/// Current server time in microseconds since the Unix epoch
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

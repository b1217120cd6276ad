//! Topic registry
//!
//! The registry holds the authoritative set of named, typed topics and the
//! publishers bound to each one. Every mutation returns the [`TopicEvent`]s it
//! caused; the [`Instance`](crate::Instance) forwards them to the subscription
//! engine before any value of the topic is delivered.
//!
//! # Topic lifetime
//!
//! ```text
//!   announce(pub A) ──► [created] ──► announce(pub B)
//!                           │
//!                 remove(A), remove(B)
//!                           │
//!              retained/persistent set? ── yes ──► kept (no publishers)
//!                           │ no                        │
//!                           ▼                 set_properties(retained=false)
//!                      [deleted] ◄──────────────────────┘
//! ```

pub mod entry;
pub mod error;
pub mod event;
pub mod store;
pub mod topic;

pub use entry::TopicEntry;
pub use error::RegistryError;
pub use event::TopicEvent;
pub use store::TopicRegistry;
pub use topic::{Announcement, PublisherKey, TopicId, TopicInfo};

//! Subscription engine
//!
//! Subscribers register one or more topic patterns; the engine keeps each
//! subscriber's matched topic set current as topics come and go, and fans
//! values out into per-subscriber delivery queues.
//!
//! ```text
//!   Instance::set_value ──► ValueStore cell (write-locked)
//!                                  │ on_stored
//!                                  ▼
//!                    SubscriptionEngine::on_value
//!                      │            │            │
//!                      ▼            ▼            ▼
//!                 [outbox A]   [outbox B]   [listener]
//!                      │            │            │
//!                 connection   connection    callback
//! ```

pub mod delivery;
pub mod engine;
pub mod options;
pub mod pattern;

pub use delivery::{
    delivery_channel, Delivery, DeliveryEvent, DeliveryReceiver, DeliverySender, SubscriberId,
};
pub use engine::{SubscriberEntry, SubscriptionEngine};
pub use options::SubscriberOptions;
pub use pattern::TopicPattern;

//! Remote table client
//!
//! Connects to a [`TableServer`](crate::server::TableServer) over TCP:
//! publish topics, write values, subscribe and receive announcements and
//! value updates.

pub mod config;
pub mod connector;

pub use config::ClientConfig;
pub use connector::{AnnouncedTopic, TableClient};

//! Table server
//!
//! Accepts TCP clients, runs the handshake and bridges each connection to
//! the shared [`Instance`](crate::instance::Instance).

pub mod config;
pub mod connection;
pub mod listener;

pub use config::ServerConfig;
pub use connection::Connection;
pub use listener::TableServer;

//! # nettables
//!
//! Real-time publish/subscribe table synchronization. Named, typed topics
//! carry timestamped values; clients publish and subscribe in-process or
//! over TCP through a [`TableServer`].
//!
//! ## Modules
//!
//! - `value`: value types, timestamped values and topic properties
//! - `registry`: topic lifecycle (announce, publishers, properties, removal)
//! - `storage`: last-write-wins value cells
//! - `subscription`: patterns, options and the delivery engine
//! - `instance`: the in-process hub tying the above together, plus local clients
//! - `meta`: `$`-prefixed metadata topics describing clients and topics
//! - `protocol`: wire messages, framing and the handshake
//! - `server` / `client`: TCP server and remote client
//!
//! ## Example
//!
//! ```no_run
//! use nettables::{ServerConfig, TableServer};
//!
//! # async fn example() -> nettables::error::Result<()> {
//! let server = TableServer::new(ServerConfig::default());
//! let robot = server.instance().local_client("robot");
//! let speed = robot.publish("/robot/speed", nettables::ValueType::Double)?;
//! speed.set(1.5)?;
//! server.run().await
//! # }
//! ```

pub mod client;
pub mod error;
pub mod instance;
pub mod meta;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod storage;
pub mod subscription;
pub mod value;

pub use client::{ClientConfig, TableClient};
pub use error::{Error, Result};
pub use instance::{Instance, InstanceConfig, LocalClient};
pub use server::{ServerConfig, TableServer};
pub use subscription::SubscriberOptions;
pub use value::{Properties, TimestampedValue, Value, ValueType};

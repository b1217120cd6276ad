//! Client context
//!
//! Identity of a connected client, passed to connection listeners and used
//! to build introspection metadata.

use std::net::SocketAddr;
use std::time::Instant;

/// Instance-assigned client identifier
pub type ClientId = u64;

/// Read-only description of a connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Unique client ID
    pub id: ClientId,

    /// Name announced in Hello (or given to a local client)
    pub name: String,

    /// Remote peer address (None for local clients)
    pub peer: Option<SocketAddr>,

    /// Negotiated protocol version
    pub version: u16,

    pub connected_at: Instant,
}

impl ClientInfo {
    pub fn new(id: ClientId, name: impl Into<String>, peer: Option<SocketAddr>, version: u16) -> Self {
        Self {
            id,
            name: name.into(),
            peer,
            version,
            connected_at: Instant::now(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.peer.is_none()
    }

    /// Peer address as text, empty for local clients
    pub fn peer_string(&self) -> String {
        self.peer.map(|p| p.to_string()).unwrap_or_default()
    }
}

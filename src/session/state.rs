//! Connection state machine
//!
//! Tracks a connection from accept to close.
//!
//! ```text
//! Connecting ──► Handshaking ──► Active ──► Disconnecting ──► Closed
//!      │              │             │                            ▲
//!      └──────────────┴─────────────┴──── transport failure ─────┘
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::context::ClientId;

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Transport accepted, nothing received yet
    Connecting,
    /// Waiting for Hello
    Handshaking,
    /// Handshake complete, messages flow
    Active,
    /// Orderly shutdown in progress
    Disconnecting,
    /// Connection closed; terminal
    Closed,
}

impl ConnectionPhase {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Handshaking => "handshaking",
            ConnectionPhase::Active => "active",
            ConnectionPhase::Disconnecting => "disconnecting",
            ConnectionPhase::Closed => "closed",
        }
    }
}

/// Per-connection state
#[derive(Debug)]
pub struct SessionState {
    /// Client ID (assigned when the handshake starts)
    pub id: ClientId,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    pub phase: ConnectionPhase,

    /// Connection start time
    pub connected_at: Instant,

    /// Time when handshake completed
    pub handshake_completed_at: Option<Instant>,

    /// Negotiated protocol version
    pub version: Option<u16>,

    /// Client name from Hello
    pub name: Option<String>,

    /// Time of the last inbound data
    pub last_activity: Instant,
}

impl SessionState {
    pub fn new(id: ClientId, peer_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer_addr,
            phase: ConnectionPhase::Connecting,
            connected_at: now,
            handshake_completed_at: None,
            version: None,
            name: None,
            last_activity: now,
        }
    }

    /// Transition to handshaking phase
    pub fn start_handshake(&mut self) {
        if self.phase == ConnectionPhase::Connecting {
            self.phase = ConnectionPhase::Handshaking;
        }
    }

    /// Complete handshake
    pub fn complete_handshake(&mut self, version: u16, name: String) {
        if self.phase == ConnectionPhase::Handshaking {
            self.phase = ConnectionPhase::Active;
            self.version = Some(version);
            self.name = Some(name);
            self.handshake_completed_at = Some(Instant::now());
        }
    }

    /// Begin orderly shutdown
    pub fn begin_disconnect(&mut self) {
        if self.phase != ConnectionPhase::Closed {
            self.phase = ConnectionPhase::Disconnecting;
        }
    }

    /// Transport failure or final close
    pub fn close(&mut self) {
        self.phase = ConnectionPhase::Closed;
    }

    /// Record inbound activity
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last inbound data
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn is_active(&self) -> bool {
        self.phase == ConnectionPhase::Active
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn state() -> SessionState {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5810);
        SessionState::new(1, addr)
    }

    #[test]
    fn test_session_lifecycle() {
        let mut state = state();
        assert_eq!(state.phase, ConnectionPhase::Connecting);

        state.start_handshake();
        assert_eq!(state.phase, ConnectionPhase::Handshaking);

        state.complete_handshake(0x0401, "dash".into());
        assert!(state.is_active());
        assert_eq!(state.version, Some(0x0401));
        assert!(state.handshake_completed_at.is_some());

        state.begin_disconnect();
        assert_eq!(state.phase, ConnectionPhase::Disconnecting);

        state.close();
        assert!(state.is_closed());
    }

    #[test]
    fn test_transport_failure_goes_straight_to_closed() {
        let mut state = state();
        state.start_handshake();
        state.close();
        assert_eq!(state.phase, ConnectionPhase::Closed);

        // No way back
        state.begin_disconnect();
        state.complete_handshake(0x0401, "late".into());
        assert_eq!(state.phase, ConnectionPhase::Closed);
    }

    #[test]
    fn test_handshake_requires_handshaking_phase() {
        let mut state = state();
        state.complete_handshake(0x0401, "early".into());
        assert_eq!(state.phase, ConnectionPhase::Connecting);
        assert!(state.version.is_none());
    }
}

//! Statistics for connections and the server

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Connection-level statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Total bytes received
    pub bytes_received: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Messages decoded
    pub messages_received: u64,
    /// Messages encoded
    pub messages_sent: u64,
    /// Frames dropped because they failed to decode
    pub codec_errors: u64,
    /// Values dropped as older than the stored one
    pub stale_values: u64,
    /// Connection duration
    pub duration: Duration,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average inbound rate in bytes per second
    pub fn receive_rate(&self) -> u64 {
        let secs = self.duration.as_secs();
        if secs > 0 {
            self.bytes_received / secs
        } else {
            0
        }
    }
}

/// Server-wide statistics, shared between the accept loop and connections
#[derive(Debug)]
pub struct ServerStats {
    started_at: Instant,
    accepted: AtomicU64,
    rejected: AtomicU64,
    active: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    stale_values: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    /// Connections accepted (handshake completed)
    pub total_connections: u64,
    /// Connections refused (limit, handshake failure)
    pub rejected_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub stale_values: u64,
    pub uptime: Duration,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            active: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            stale_values: AtomicU64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished connection's counters in
    pub fn connection_closed(&self, stats: &ConnectionStats) {
        // Never below zero
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        self.bytes_received.fetch_add(stats.bytes_received, Ordering::Relaxed);
        self.bytes_sent.fetch_add(stats.bytes_sent, Ordering::Relaxed);
        self.stale_values.fetch_add(stats.stale_values, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            total_connections: self.accepted.load(Ordering::Relaxed),
            rejected_connections: self.rejected.load(Ordering::Relaxed),
            active_connections: self.active.load(Ordering::Relaxed),
            total_bytes_received: self.bytes_received.load(Ordering::Relaxed),
            total_bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            stale_values: self.stale_values.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

//! Client configuration

use std::time::Duration;

use crate::protocol::constants::*;

/// Client configuration options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address as `host:port`
    pub server_addr: String,

    /// Name sent in the Hello message
    pub client_name: String,

    /// TCP connect and handshake must complete within this time
    pub connect_timeout: Duration,

    /// Send a keep-alive after this long without outbound traffic
    pub keep_alive_interval: Duration,

    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,

    /// Largest accepted frame payload
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            client_name: String::from("nettables-client"),
            connect_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(1),
            tcp_nodelay: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a config for a server address
    ///
    /// A bare host gets the default port.
    pub fn new(server_addr: impl Into<String>) -> Self {
        let mut addr = server_addr.into();
        if !addr.contains(':') {
            addr = format!("{}:{}", addr, DEFAULT_PORT);
        }
        Self {
            server_addr: addr,
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.max(FRAME_HEADER_LEN);
        self
    }
}

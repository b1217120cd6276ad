//! Table server listener
//!
//! Handles the TCP accept loop, spawns a worker per connection and drives
//! the periodic flush of rate-limited subscribers.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::instance::{Instance, InstanceConfig};
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::stats::ServerStats;

/// Table server
pub struct TableServer {
    config: ServerConfig,
    instance: Arc<Instance>,
    stats: Arc<ServerStats>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl TableServer {
    /// Create a server with a fresh instance
    pub fn new(config: ServerConfig) -> Self {
        let instance = Instance::new(InstanceConfig::new().meta_topics(config.meta_topics));
        Self::with_instance(config, Arc::new(instance))
    }

    /// Create a server around an existing instance
    ///
    /// Local clients of `instance` share topics with remote ones.
    pub fn with_instance(config: ServerConfig, instance: Arc<Instance>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            instance,
            stats: Arc::new(ServerStats::new()),
            connection_semaphore,
        }
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_until(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Table server listening");

        let flush_handle = self.spawn_flush_task();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        flush_handle.abort();

        result
    }

    /// Periodically release pending values of rate-limited subscribers
    fn spawn_flush_task(&self) -> JoinHandle<()> {
        let instance = Arc::clone(&self.instance);
        let period = self.config.flush_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let flushed = instance.flush_due(Instant::now());
                if flushed > 0 {
                    tracing::trace!(flushed = flushed, "Flushed pending values");
                }
            }
        })
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.stats.connection_rejected();
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let mut connection = Connection::new(
            socket,
            peer_addr,
            self.config.clone(),
            Arc::clone(&self.instance),
            Arc::clone(&self.stats),
        );
        let client_id = connection.client_id();

        tracing::debug!(client_id = client_id, peer = %peer_addr, "New connection");

        tokio::spawn(async move {
            let _permit = permit;

            if let Err(e) = connection.run().await {
                tracing::debug!(client_id = client_id, error = %e, "Connection error");
            }
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}

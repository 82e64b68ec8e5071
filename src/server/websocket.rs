//! WebSocket server implementation
//!
//! Listens on a configurable address, upgrades connections on the heartbeat
//! endpoint and runs one heartbeat session per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

use super::heartbeat::HeartbeatSession;
use super::protocol::SHUTDOWN_CLOSE_REASON;
use crate::config::{ServerSettings, DEFAULT_ENDPOINT};
use crate::registry::{Accepted, ConnectionRegistry, RegistryError, DEFAULT_CHANNEL_BUFFER};

/// How long shutdown waits for connections to flush their close frames
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Request path accepted for the upgrade
    pub endpoint: String,
    /// Close connections that stay silent this long
    pub idle_timeout: Option<Duration>,
    /// Outbound frames a connection may queue before it is dropped
    pub channel_buffer: usize,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            idle_timeout: None,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }

    /// Set the upgrade endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the per-connection outbound queue size
    pub fn with_channel_buffer(mut self, channel_buffer: usize) -> Self {
        self.channel_buffer = channel_buffer;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        ServerConfig::new(settings.bind.clone(), settings.port)
            .with_endpoint(settings.endpoint.clone())
            .with_idle_timeout(settings.idle_timeout())
            .with_channel_buffer(settings.channel_buffer_size)
    }
}

/// WebSocket server for heartbeat clients
pub struct WebSocketServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server with an empty registry
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = ConnectionRegistry::with_channel_buffer(config.channel_buffer);
        Self {
            config,
            registry: Arc::new(registry),
            shutdown_tx,
        }
    }

    /// Registry shared by all connections of this server
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {}", addr))?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    ///
    /// On shutdown every connection is sent a close frame, and this returns
    /// once they have all been flushed or [`SHUTDOWN_GRACE`] has passed.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "WebSocket server listening on ws://{}{}",
            local_addr, self.config.endpoint
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let endpoint = self.config.endpoint.clone();
                            let idle_timeout = self.config.idle_timeout;

                            connections.spawn(async move {
                                match handle_connection(stream, peer_addr, registry, endpoint, idle_timeout, shutdown_rx).await {
                                    Ok(()) => {}
                                    Err(RegistryError::UnknownEndpoint) => {
                                        warn!("Rejected upgrade from {} on unknown endpoint", peer_addr);
                                    }
                                    Err(e) => {
                                        error!("Connection error from {}: {}", peer_addr, e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connection tasks
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let active = self.registry.len().await;
        if active > 0 {
            info!("Closing {} active connections...", active);
            self.registry
                .close_all(CloseCode::Away, SHUTDOWN_CLOSE_REASON)
                .await;
        }

        let drain = async { while connections.join_next().await.is_some() {} };
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_ok();
        if !drained {
            warn!(
                "{} connections still open after {:?}, aborting them",
                connections.len(),
                SHUTDOWN_GRACE
            );
            connections.abort_all();
        }

        Ok(())
    }
}

/// Handle a single WebSocket connection
///
/// Returns after the heartbeat session has ended and the writer has flushed
/// its last frame.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    endpoint: String,
    idle_timeout: Option<Duration>,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RegistryError> {
    info!("New WebSocket connection attempt from {}", peer_addr);

    let Accepted {
        handle,
        inbound,
        mut writer,
    } = registry.connect(stream, peer_addr, &endpoint).await?;
    let conn_id = handle.id();
    debug!(conn_id = %conn_id, "Heartbeat session started for {}", peer_addr);

    let session = HeartbeatSession::new(registry, handle, idle_timeout);
    let reason = session.run(inbound, shutdown_rx).await;

    // The session held the last handle, so the writer drains and stops.
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut writer).await.is_err() {
        warn!(conn_id = %conn_id, "Writer for {} did not finish, aborting", peer_addr);
        writer.abort();
    }

    info!(conn_id = %conn_id, "Connection from {} closed: {:?}", peer_addr, reason);
    Ok(())
}

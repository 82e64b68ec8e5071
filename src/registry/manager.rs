//! Connection registry
//!
//! Keeps every accepted websocket in insertion order and provides unicast and
//! broadcast delivery. One registry is created at startup and shared with each
//! connection task through an `Arc`.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite, WebSocketStream};
use tracing::{debug, info, warn};

use super::handle::{run_writer, ConnectionHandle, ConnectionId, DEFAULT_CHANNEL_BUFFER};

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(tungstenite::Error),

    #[error("Upgrade requested on unknown endpoint")]
    UnknownEndpoint,

    #[error("Connection {0} is closed")]
    Transport(ConnectionId),
}

impl From<tungstenite::Error> for RegistryError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(ref response) if response.status() == StatusCode::NOT_FOUND => {
                RegistryError::UnknownEndpoint
            }
            other => RegistryError::Handshake(other),
        }
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Inbound half of an accepted websocket
pub type Inbound<S> = SplitStream<WebSocketStream<S>>;

/// Outcome of a broadcast, in registry order
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BroadcastReport {
    /// Connections the message was queued for
    pub delivered: Vec<ConnectionId>,
    /// Connections whose channel was already closed
    pub failed: Vec<ConnectionId>,
}

/// A connection accepted by [`ConnectionRegistry::connect`]
pub struct Accepted<S> {
    /// Registered handle
    pub handle: Arc<ConnectionHandle>,
    /// Frames sent by the client
    pub inbound: Inbound<S>,
    /// Writer task; completes once queued frames are flushed and the socket is closed
    pub writer: JoinHandle<()>,
}

/// Registry of active websocket connections
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: RwLock<Vec<Arc<ConnectionHandle>>>,
    channel_buffer: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::with_channel_buffer(DEFAULT_CHANNEL_BUFFER)
    }
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry whose connections queue at most
    /// `channel_buffer` outbound frames
    pub fn with_channel_buffer(channel_buffer: usize) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            channel_buffer,
        }
    }

    pub fn channel_buffer(&self) -> usize {
        self.channel_buffer
    }

    /// Accept a websocket on `stream` and register it
    ///
    /// Completes the upgrade handshake, rejecting any request whose path is
    /// not `endpoint` with 404, spawns the connection's writer task and adds
    /// the new handle to the registry.
    pub async fn connect<S>(
        &self,
        stream: S,
        peer_addr: SocketAddr,
        endpoint: &str,
    ) -> RegistryResult<Accepted<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let expected = endpoint.to_string();
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == expected {
                Ok(response)
            } else {
                debug!("Rejecting upgrade on {}", request.uri().path());
                let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        };

        let ws_stream = accept_hdr_async(stream, check_path).await?;
        let (sink, inbound) = ws_stream.split();

        let (handle, receiver) = ConnectionHandle::new(peer_addr, self.channel_buffer);
        let handle = Arc::new(handle);
        let writer = tokio::spawn(run_writer(sink, receiver, handle.id()));

        self.register(Arc::clone(&handle)).await;
        Ok(Accepted {
            handle,
            inbound,
            writer,
        })
    }

    /// Append a handle. Registering the same connection twice is a no-op.
    pub async fn register(&self, handle: Arc<ConnectionHandle>) {
        let mut connections = self.connections.write().await;
        if connections.iter().any(|c| c.id() == handle.id()) {
            debug!(conn_id = %handle.id(), "Connection already registered");
            return;
        }
        info!(conn_id = %handle.id(), peer = %handle.peer_addr(), "Connection registered");
        connections.push(handle);
    }

    /// Remove a handle if present
    ///
    /// Returns whether it was removed. Calling this for a connection that is
    /// no longer registered only logs.
    pub async fn disconnect(&self, handle: &ConnectionHandle) -> bool {
        let mut connections = self.connections.write().await;
        match connections.iter().position(|c| c.id() == handle.id()) {
            Some(index) => {
                connections.remove(index);
                info!(
                    conn_id = %handle.id(),
                    remaining = connections.len(),
                    "Connection removed"
                );
                true
            }
            None => {
                debug!(conn_id = %handle.id(), "Connection not found in registry");
                false
            }
        }
    }

    /// Send a text message to one connection
    pub fn send_to(&self, message: &str, handle: &ConnectionHandle) -> RegistryResult<()> {
        handle.send_text(message)
    }

    /// Queue a close frame for one connection
    pub fn close(
        &self,
        handle: &ConnectionHandle,
        code: CloseCode,
        reason: &str,
    ) -> RegistryResult<()> {
        handle.close(code, reason)
    }

    /// Send a text message to every registered connection
    ///
    /// Connections are visited in insertion order. A closed connection is
    /// recorded in the report and does not stop delivery to the others.
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        let connections = self.connections.read().await;
        let mut report = BroadcastReport::default();

        for connection in connections.iter() {
            match connection.send_text(message) {
                Ok(()) => report.delivered.push(connection.id()),
                Err(e) => {
                    warn!(conn_id = %connection.id(), "Broadcast send failed: {}", e);
                    report.failed.push(connection.id());
                }
            }
        }

        debug!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast complete"
        );
        report
    }

    /// Queue a close frame for every registered connection
    pub async fn close_all(&self, code: CloseCode, reason: &str) {
        let connections = self.connections.read().await;
        for connection in connections.iter() {
            let _ = connection.close(code, reason);
        }
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn contains(&self, conn_id: ConnectionId) -> bool {
        self.connections
            .read()
            .await
            .iter()
            .any(|c| c.id() == conn_id)
    }

    /// Registered connection ids in insertion order
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .read()
            .await
            .iter()
            .map(|c| c.id())
            .collect()
    }
}

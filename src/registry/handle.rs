//! Connection handle
//!
//! A handle is the registry's view of one live websocket. Outbound frames are
//! queued on a bounded channel and written to the socket by a dedicated
//! writer task, so sending never awaits on the network.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{RegistryError, RegistryResult};

/// Unique connection identifier
pub type ConnectionId = Uuid;

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Text message
    Text(String),
    /// Close the websocket with the given code and reason
    Close { code: CloseCode, reason: String },
}

impl Outbound {
    fn into_message(self) -> Message {
        match self {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
        }
    }
}

/// Default capacity of a connection's outbound queue
pub const DEFAULT_CHANNEL_BUFFER: usize = 64;

/// Handle to a single websocket connection
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    connected_at: Instant,
    sender: mpsc::Sender<Outbound>,
    /// Set once a close frame has been queued or the connection is gone
    closing: AtomicBool,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task drains.
    ///
    /// At most `buffer` frames wait for the writer; a capacity of 0 is raised to 1.
    pub fn new(peer_addr: SocketAddr, buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            peer_addr,
            connected_at: Instant::now(),
            sender,
            closing: AtomicBool::new(false),
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Whether text can still be queued for this connection
    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    /// Mark the connection as gone. Every later send fails.
    pub fn mark_closed(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Queue a text message
    ///
    /// A full queue means the peer is not reading; the handle is marked
    /// closed and the send fails like one on a dead channel.
    pub fn send_text(&self, text: impl Into<String>) -> RegistryResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(RegistryError::Transport(self.id));
        }
        self.enqueue(Outbound::Text(text.into()))
    }

    /// Queue a close frame. Only the first call has an effect.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> RegistryResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.enqueue(Outbound::Close {
            code,
            reason: reason.into(),
        })
    }

    fn enqueue(&self, frame: Outbound) -> RegistryResult<()> {
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, "Outbound queue full, dropping connection");
                self.mark_closed();
                Err(RegistryError::Transport(self.id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mark_closed();
                Err(RegistryError::Transport(self.id))
            }
        }
    }
}

/// Drain queued frames into the socket until a close frame is written, a write
/// fails, or every handle clone has been dropped.
pub async fn run_writer<S>(
    mut sink: S,
    mut receiver: mpsc::Receiver<Outbound>,
    conn_id: ConnectionId,
) where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(frame) = receiver.recv().await {
        let is_close = matches!(frame, Outbound::Close { .. });
        if let Err(e) = sink.send(frame.into_message()).await {
            debug!(conn_id = %conn_id, "Write failed, stopping writer: {}", e);
            break;
        }
        if is_close {
            break;
        }
    }

    // Dropping the receiver makes further sends on the handle fail.
    receiver.close();
    let _ = sink.close().await;
    debug!(conn_id = %conn_id, "Writer finished");
}

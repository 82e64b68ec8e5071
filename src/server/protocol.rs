//! Heartbeat protocol
//!
//! The client sends the exact text `ping` and the server answers `pong`.
//! Anything else is a protocol violation: the server sends a fixed notice and
//! closes the connection, after which the client has to reconnect.

use tokio_tungstenite::tungstenite::Message;

/// Liveness probe sent by the client
pub const PING: &str = "ping";

/// Liveness reply sent by the server
pub const PONG: &str = "pong";

/// Sent before closing a connection that delivered a non-heartbeat payload
pub const NON_HEARTBEAT_NOTICE: &str = "非探活请求,关闭ws连接,关闭ws后,需要重新建立连接...";

/// Close reason attached to the close frame after a protocol violation
pub const VIOLATION_CLOSE_REASON: &str = "non-heartbeat payload";

/// Close reason used when an idle connection is dropped
pub const IDLE_CLOSE_REASON: &str = "idle timeout";

/// Close reason used during server shutdown
pub const SHUTDOWN_CLOSE_REASON: &str = "server shutting down";

/// Classification of an inbound websocket frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// A valid heartbeat probe
    Heartbeat,
    /// Any payload other than the probe
    Violation,
    /// Websocket control frame, handled by the transport
    Control,
    /// The peer sent a close frame
    Close,
}

impl Inbound {
    /// Classify a frame received from the client
    pub fn classify(message: &Message) -> Self {
        match message {
            Message::Text(text) if text == PING => Inbound::Heartbeat,
            Message::Text(_) | Message::Binary(_) => Inbound::Violation,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Control,
            Message::Close(_) => Inbound::Close,
        }
    }
}

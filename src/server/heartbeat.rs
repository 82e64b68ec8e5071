//! Per-connection heartbeat loop
//!
//! Each accepted connection runs one [`HeartbeatSession`]. The session waits
//! for frames, answers heartbeats, and tears the connection down on a protocol
//! violation, a transport disconnect, an idle timeout or server shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::protocol::{
    Inbound, IDLE_CLOSE_REASON, NON_HEARTBEAT_NOTICE, PONG, SHUTDOWN_CLOSE_REASON,
    VIOLATION_CLOSE_REASON,
};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Why a session reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent something other than a heartbeat
    ProtocolViolation,
    /// The client or the network closed the channel
    TransportDisconnect,
    /// No frame arrived within the idle timeout
    IdleTimeout,
    /// The server is shutting down
    Shutdown,
}

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingMessage,
    Closed(CloseReason),
}

/// Something that happened on the connection while awaiting a message
#[derive(Debug)]
enum Event {
    Frame(Message),
    Disconnected(Option<WsError>),
    Idle,
    Shutdown,
}

/// Heartbeat control loop for one connection
pub struct HeartbeatSession {
    registry: Arc<ConnectionRegistry>,
    handle: Arc<ConnectionHandle>,
    idle_timeout: Option<Duration>,
    state: SessionState,
}

impl HeartbeatSession {
    /// Create a session for an already registered connection
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        handle: Arc<ConnectionHandle>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            handle,
            idle_timeout,
            state: SessionState::AwaitingMessage,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until it closes
    pub async fn run<St>(
        mut self,
        mut inbound: St,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> CloseReason
    where
        St: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            if let SessionState::Closed(reason) = self.state {
                return reason;
            }

            let event = tokio::select! {
                event = next_event(&mut inbound, self.idle_timeout) => event,
                _ = shutdown_rx.recv() => Event::Shutdown,
            };
            self.state = self.on_event(event).await;
        }
    }

    async fn on_event(&mut self, event: Event) -> SessionState {
        let conn_id = self.handle.id();

        match event {
            Event::Frame(message) => match Inbound::classify(&message) {
                Inbound::Heartbeat => {
                    debug!(conn_id = %conn_id, "Received heartbeat");
                    match self.registry.send_to(PONG, &self.handle) {
                        Ok(()) => SessionState::AwaitingMessage,
                        Err(e) => {
                            debug!(conn_id = %conn_id, "Heartbeat reply failed: {}", e);
                            self.finish(CloseReason::TransportDisconnect).await
                        }
                    }
                }
                Inbound::Violation => {
                    info!(conn_id = %conn_id, "Received non-heartbeat message: {:?}", message);
                    let _ = self.registry.send_to(NON_HEARTBEAT_NOTICE, &self.handle);
                    let _ = self.registry.close(
                        &self.handle,
                        CloseCode::Policy,
                        VIOLATION_CLOSE_REASON,
                    );
                    self.finish(CloseReason::ProtocolViolation).await
                }
                Inbound::Control => SessionState::AwaitingMessage,
                Inbound::Close => {
                    info!(conn_id = %conn_id, "Client closed the connection");
                    self.finish(CloseReason::TransportDisconnect).await
                }
            },
            Event::Disconnected(error) => {
                match error {
                    Some(e) => warn!(conn_id = %conn_id, "WebSocket error: {}", e),
                    None => info!(conn_id = %conn_id, "Connection closed by peer"),
                }
                self.finish(CloseReason::TransportDisconnect).await
            }
            Event::Idle => {
                info!(conn_id = %conn_id, "Connection idle, closing");
                let _ = self
                    .registry
                    .close(&self.handle, CloseCode::Normal, IDLE_CLOSE_REASON);
                self.finish(CloseReason::IdleTimeout).await
            }
            Event::Shutdown => {
                debug!(conn_id = %conn_id, "Shutdown signal received");
                let _ = self
                    .registry
                    .close(&self.handle, CloseCode::Away, SHUTDOWN_CLOSE_REASON);
                self.finish(CloseReason::Shutdown).await
            }
        }
    }

    async fn finish(&self, reason: CloseReason) -> SessionState {
        self.handle.mark_closed();
        self.registry.disconnect(&self.handle).await;
        SessionState::Closed(reason)
    }
}

/// Wait for the next frame, bounded by the idle timeout when one is set
async fn next_event<St>(inbound: &mut St, idle_timeout: Option<Duration>) -> Event
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, inbound.next()).await {
            Ok(next) => next,
            Err(_) => return Event::Idle,
        },
        None => inbound.next().await,
    };

    match next {
        Some(Ok(message)) => Event::Frame(message),
        Some(Err(e)) => Event::Disconnected(Some(e)),
        None => Event::Disconnected(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Outbound, RegistryError};
    use futures_util::stream;
    use tokio::sync::mpsc;

    fn detached() -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let (handle, rx) = ConnectionHandle::new("127.0.0.1:40000".parse().unwrap(), 8);
        (Arc::new(handle), rx)
    }

    fn frames(texts: &[&str]) -> Vec<Result<Message, WsError>> {
        texts.iter().map(|t| Ok(Message::text(*t))).collect()
    }

    async fn registered() -> (
        Arc<ConnectionRegistry>,
        Arc<ConnectionHandle>,
        mpsc::Receiver<Outbound>,
    ) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, rx) = detached();
        registry.register(Arc::clone(&handle)).await;
        (registry, handle, rx)
    }

    #[tokio::test]
    async fn test_ping_gets_pong_and_keeps_connection() {
        let (registry, handle, mut rx) = registered().await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let inbound = stream::iter(frames(&["ping", "ping"])).chain(stream::pending());
        let session = HeartbeatSession::new(Arc::clone(&registry), Arc::clone(&handle), None);
        let task = tokio::spawn(session.run(inbound, shutdown_rx));

        assert_eq!(rx.recv().await, Some(Outbound::Text("pong".to_string())));
        assert_eq!(rx.recv().await, Some(Outbound::Text("pong".to_string())));
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.len().await, 1);

        shutdown_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                code: CloseCode::Away,
                reason: SHUTDOWN_CLOSE_REASON.to_string()
            })
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_other_payload_gets_notice_and_close() {
        let (registry, handle, mut rx) = registered().await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // Frames after the violation are never processed.
        let inbound = stream::iter(frames(&["hello", "ping"]));
        let session = HeartbeatSession::new(Arc::clone(&registry), handle, None);
        let reason = session.run(inbound, shutdown_rx).await;

        assert_eq!(reason, CloseReason::ProtocolViolation);
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Text(NON_HEARTBEAT_NOTICE.to_string()))
        );
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                code: CloseCode::Policy,
                reason: VIOLATION_CLOSE_REASON.to_string()
            })
        );
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_binary_payload_is_violation() {
        let (registry, handle, _rx) = registered().await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let inbound = stream::iter(vec![Ok::<_, WsError>(Message::binary(b"ping".to_vec()))]);
        let session = HeartbeatSession::new(Arc::clone(&registry), handle, None);
        assert_eq!(
            session.run(inbound, shutdown_rx).await,
            CloseReason::ProtocolViolation
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_end_of_stream_disconnects() {
        let (registry, handle, mut rx) = registered().await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let inbound = stream::iter(frames(&["ping"]));
        let session = HeartbeatSession::new(Arc::clone(&registry), handle, None);
        let reason = session.run(inbound, shutdown_rx).await;

        assert_eq!(reason, CloseReason::TransportDisconnect);
        assert_eq!(rx.recv().await, Some(Outbound::Text("pong".to_string())));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_frame_and_errors_disconnect() {
        let (registry, handle, _rx) = registered().await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let inbound = stream::iter(vec![Ok::<_, WsError>(Message::Close(None))]).chain(stream::pending());
        let session = HeartbeatSession::new(Arc::clone(&registry), handle, None);
        assert_eq!(
            session.run(inbound, shutdown_rx).await,
            CloseReason::TransportDisconnect
        );
        assert!(registry.is_empty().await);

        let (registry, handle, _rx) = registered().await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let inbound = stream::iter(vec![Err::<Message, _>(WsError::ConnectionClosed)]);
        let session = HeartbeatSession::new(Arc::clone(&registry), handle, None);
        assert_eq!(
            session.run(inbound, shutdown_rx).await,
            CloseReason::TransportDisconnect
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_control_frames_are_ignored() {
        let (registry, handle, mut rx) = registered().await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let inbound = stream::iter(vec![
            Ok::<_, WsError>(Message::Ping(vec![1, 2])),
            Ok(Message::Pong(vec![])),
            Ok(Message::text("ping")),
        ]);
        let session = HeartbeatSession::new(Arc::clone(&registry), handle, None);
        assert_eq!(
            session.run(inbound, shutdown_rx).await,
            CloseReason::TransportDisconnect
        );
        assert_eq!(rx.recv().await, Some(Outbound::Text("pong".to_string())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_reply_is_treated_as_disconnect() {
        let (registry, handle, rx) = registered().await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        drop(rx);

        let inbound = stream::iter(frames(&["ping"])).chain(stream::pending());
        let session = HeartbeatSession::new(Arc::clone(&registry), handle, None);
        assert_eq!(
            session.run(inbound, shutdown_rx).await,
            CloseReason::TransportDisconnect
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_silent_connection() {
        let (registry, handle, mut rx) = registered().await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let inbound = stream::pending::<Result<Message, WsError>>();
        let session = HeartbeatSession::new(
            Arc::clone(&registry),
            handle,
            Some(Duration::from_millis(50)),
        );
        assert_eq!(
            session.run(inbound, shutdown_rx).await,
            CloseReason::IdleTimeout
        );
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                code: CloseCode::Normal,
                reason: IDLE_CLOSE_REASON.to_string()
            })
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_without_idle_timeout_connection_stays_open() {
        let (registry, handle, _rx) = registered().await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let inbound = stream::pending::<Result<Message, WsError>>();
        let session = HeartbeatSession::new(Arc::clone(&registry), handle, None);
        let result =
            tokio::time::timeout(Duration::from_millis(100), session.run(inbound, shutdown_rx))
                .await;

        assert!(result.is_err());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_unread_replies_do_not_pile_up() {
        let (registry, handle, mut rx) = registered().await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // The writer never drains, so the queue fills and the session gives up.
        let pings: Vec<&str> = vec!["ping"; 10_000];
        let inbound = stream::iter(frames(&pings)).chain(stream::pending());
        let session = HeartbeatSession::new(Arc::clone(&registry), Arc::clone(&handle), None);
        assert_eq!(
            session.run(inbound, shutdown_rx).await,
            CloseReason::TransportDisconnect
        );

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 8);
        assert!(!handle.is_open());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_send_fails_after_peer_drops() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (client_io, server_io) = tokio::io::duplex(4096);
        let peer = "127.0.0.1:40000".parse().unwrap();

        let (accepted, client) = tokio::join!(
            registry.connect(server_io, peer, "/v0/heartbeat"),
            tokio_tungstenite::client_async("ws://localhost/v0/heartbeat", client_io)
        );
        let accepted = accepted.unwrap();
        let (client, _) = client.unwrap();
        let handle = Arc::clone(&accepted.handle);

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = HeartbeatSession::new(Arc::clone(&registry), accepted.handle, None);
        let task = tokio::spawn(session.run(accepted.inbound, shutdown_rx));

        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::TransportDisconnect);

        assert!(!handle.is_open());
        assert!(matches!(
            registry.send_to("pong", &handle),
            Err(RegistryError::Transport(id)) if id == handle.id()
        ));
        assert!(registry.is_empty().await);
        assert!(registry.broadcast("anyone").await.delivered.is_empty());
    }

    #[test]
    fn test_new_session_awaits_message() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, _rx) = detached();
        let session = HeartbeatSession::new(registry, handle, None);
        assert_eq!(session.state(), SessionState::AwaitingMessage);
    }
}

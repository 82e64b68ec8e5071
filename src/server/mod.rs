//! WebSocket server module
//!
//! Accepts heartbeat connections and runs the ping/pong protocol on each.

mod heartbeat;
mod protocol;
mod websocket;

#[allow(unused_imports)]
pub use heartbeat::*;
#[allow(unused_imports)]
pub use protocol::*;
pub use websocket::*;

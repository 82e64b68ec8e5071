//! Connection registry module
//!
//! Tracks open websocket connections and delivers outbound messages to them.

#[allow(dead_code)]
mod handle;
#[allow(dead_code)]
mod manager;

#[allow(unused_imports)]
pub use handle::*;
pub use manager::*;

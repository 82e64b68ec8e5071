//! Server settings
//!
//! Loads heartbeat server settings from a TOML file. Every field is optional;
//! missing fields fall back to the built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::registry::DEFAULT_CHANNEL_BUFFER;

/// Default bind address
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Default listen port
pub const DEFAULT_PORT: u16 = 8880;
/// Websocket endpoint serving the heartbeat protocol
pub const DEFAULT_ENDPOINT: &str = "/v0/heartbeat";

/// Errors that can occur while loading settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// `[server]` table of the settings file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Full request path accepted for the websocket upgrade. When clients
    /// reach this server behind a mount prefix, include it here (for example
    /// `/adh/common/v0/heartbeat`).
    pub endpoint: String,
    /// Close connections that stay silent this long (0 or absent disables it)
    pub idle_timeout_secs: Option<u64>,
    /// Outbound frames a connection may queue before it is dropped
    pub channel_buffer_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            idle_timeout_secs: None,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER,
        }
    }
}

impl ServerSettings {
    /// Idle timeout as a duration, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        }
    }
}

/// Top-level settings file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
}

impl Settings {
    /// Load settings from a file, returning defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

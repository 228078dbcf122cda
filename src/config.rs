//! Configuration types for tunnel server and client

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Default value functions for serde
// =============================================================================

const fn default_handshake_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_token_cache_size() -> usize {
    128
}

const fn default_peer_dial_deadline() -> Duration {
    Duration::from_secs(15)
}

const fn default_ping_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_reconnect_interval() -> Duration {
    Duration::from_secs(60)
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Server-side tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Time allowed for the WebSocket upgrade handshake
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Maximum number of cached client tokens
    #[serde(default = "default_token_cache_size")]
    pub token_cache_size: usize,

    /// Dial deadline applied when forwarding through a peer
    #[serde(default = "default_peer_dial_deadline", with = "humantime_serde")]
    pub peer_dial_deadline: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: default_handshake_timeout(),
            token_cache_size: default_token_cache_size(),
            peer_dial_deadline: default_peer_dial_deadline(),
        }
    }
}

impl ServerConfig {
    /// Create a new server config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if a timeout is zero or the token cache has
    /// no capacity.
    pub fn validate(&self) -> Result<(), String> {
        if self.handshake_timeout.is_zero() {
            return Err("handshake_timeout must be greater than zero".to_string());
        }
        if self.token_cache_size == 0 {
            return Err("token_cache_size must be greater than zero".to_string());
        }
        if self.peer_dial_deadline.is_zero() {
            return Err("peer_dial_deadline must be greater than zero".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Client-side tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL of the tunnel server (`ws://` or `wss://`)
    pub server_url: String,

    /// Extra headers sent with the upgrade request (authentication)
    #[serde(default)]
    pub headers: Vec<(String, String)>,

    /// Interval between keepalive pings
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Initial delay before reconnecting after a failure
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Upper bound for the exponential reconnect backoff
    #[serde(default = "default_max_reconnect_interval", with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
}

impl ClientConfig {
    /// Create a new client config for the given server URL
    #[must_use]
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            headers: Vec::new(),
            ping_interval: default_ping_interval(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
        }
    }

    /// Add a header to the upgrade request (builder pattern)
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if the URL is missing or not a WebSocket URL,
    /// a duration is zero, or the backoff bounds are inverted.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_url.is_empty() {
            return Err("server_url cannot be empty".to_string());
        }
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err("server_url must start with ws:// or wss://".to_string());
        }
        if self.ping_interval.is_zero() {
            return Err("ping_interval must be greater than zero".to_string());
        }
        if self.reconnect_interval.is_zero() {
            return Err("reconnect_interval must be greater than zero".to_string());
        }
        if self.max_reconnect_interval < self.reconnect_interval {
            return Err("max_reconnect_interval must be >= reconnect_interval".to_string());
        }
        Ok(())
    }
}

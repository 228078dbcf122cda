//! Error types for tunnel operations

use thiserror::Error;

/// Errors that can occur during tunnel operations
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Authentication of an incoming session failed
    #[error("failed authentication")]
    AuthFailed,

    /// The transport delivered a non-binary message
    #[error("wrong websocket message type")]
    WrongMessageType,

    /// A frame could not be decoded (unknown tag, short buffer, bad field)
    #[error("malformed frame: {message}")]
    MalformedFrame {
        /// What was wrong with the frame
        message: String,
    },

    /// No session is registered for the requested client key
    #[error("no session for client {client_key}")]
    NoSession {
        /// The client key that had no session
        client_key: String,
    },

    /// A Data frame referenced a connection id with no live virtual connection
    #[error("connection not found {client_key}/{session_key}/{conn_id}")]
    ConnectNotFound {
        /// Client key of the session that received the frame
        client_key: String,
        /// Session key of the session that received the frame
        session_key: i64,
        /// The unknown connection id
        conn_id: i64,
    },

    /// The connect authorizer denied a Connect or TokenConnect request
    #[error("connect not allowed to {proto}/{address}")]
    ConnectNotAllowed {
        /// Requested protocol
        proto: String,
        /// Requested address
        address: String,
    },

    /// The remote client could not dial the requested target
    #[error("dial failed: {reason}")]
    DialFailed {
        /// Failure reason reported by the dialer
        reason: String,
    },

    /// The session carrying a virtual connection went away
    #[error("tunnel disconnect")]
    TunnelDisconnect,

    /// The client returned an empty or missing token payload
    #[error("cluster {client_key} token or cacert not found")]
    TokenUnavailable {
        /// Client key the token was requested for
        client_key: String,
    },

    /// Transport-level I/O error
    #[error("connection error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config {
        /// What was wrong with the configuration
        message: String,
    },

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// The session or server is shutting down
    #[error("shutting down")]
    Shutdown,
}

impl TunnelError {
    /// Create a new malformed-frame error
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// Create a new no-session error
    #[must_use]
    pub fn no_session(client_key: impl Into<String>) -> Self {
        Self::NoSession {
            client_key: client_key.into(),
        }
    }

    /// Create a new dial-failed error
    #[must_use]
    pub fn dial_failed(reason: impl Into<String>) -> Self {
        Self::DialFailed {
            reason: reason.into(),
        }
    }

    /// Create a new token-unavailable error
    #[must_use]
    pub fn token_unavailable(client_key: impl Into<String>) -> Self {
        Self::TokenUnavailable {
            client_key: client_key.into(),
        }
    }

    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a transport error from any error type
    #[must_use]
    pub fn transport<E: std::error::Error>(err: E) -> Self {
        Self::Io {
            source: std::io::Error::other(err.to_string()),
        }
    }

    /// HTTP status code reported for this error on the server surface
    ///
    /// Authentication failures map to 401, decode and handshake problems to
    /// 400, and anything that happens after the upgrade to 500.
    #[must_use]
    pub const fn http_code(&self) -> u16 {
        match self {
            Self::AuthFailed => 401,
            Self::WrongMessageType | Self::MalformedFrame { .. } => 400,
            _ => 500,
        }
    }
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

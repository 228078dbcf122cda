//! `backhaul` - reverse tunnel multiplexer
//!
//! A long-lived WebSocket session carries many independent virtual
//! connections between a [`Server`] that accepts requests from local callers
//! and a [`TunnelClient`] (typically behind NAT) that performs the actual
//! network dials on the far side. The client connects outward once; from
//! then on the server can open arbitrary TCP streams through it as if it had
//! dialed directly.
//!
//! # Architecture
//!
//! - **Protocol**: a compact binary message per WebSocket frame (see
//!   [`protocol`])
//! - **Session**: one reader task dispatching frames, one writer task
//!   serializing them, per transport (see [`session`])
//! - **Streams**: virtual connections with socket-like read/write (see
//!   [`stream`])
//! - **Routing**: client key to session with round-robin and peer-mesh
//!   forwarding (see [`manager`]), plus a bounded LRU of cluster tokens
//!   fetched over the wire (see [`token`])
//!
//! # Example
//!
//! ```rust,no_run
//! use backhaul::{ClientConfig, TunnelClient};
//! use backhaul::client::allow_all_connections;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig::new("wss://tunnel.example.com/connect")
//!         .with_header("x-tunnel-id", "cluster-a");
//!
//!     let client = TunnelClient::new(config)
//!         .with_connect_authorizer(allow_all_connections());
//!
//!     if let Err(e) = client.run().await {
//!         eprintln!("tunnel client error: {e}");
//!     }
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod dial;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;
pub mod token;

// Re-export main types at crate root
pub use client::TunnelClient;
pub use config::{ClientConfig, ServerConfig};
pub use dial::{BoxedConn, Dialer, TunnelDuplex, DEFAULT_DIAL_TIMEOUT};
pub use error::{Result, TunnelError};
pub use manager::SessionManager;
pub use protocol::{Message, MessageType, EOF_REASON, HEADER_SIZE};
pub use server::{
    default_error_writer, Authorizer, ErrorWriter, HandshakeRequest, Server, ID_HEADER,
    TOKEN_HEADER,
};
pub use session::{ConnectAuthorizer, Session, PING_WRITE_INTERVAL};
pub use stream::TunnelStream;
pub use token::{
    register_token_getter, ClientToken, TokenCache, TokenGetter, TokenSource,
    CLIENT_TOKEN_ADDRESS, CLIENT_TOKEN_PROTO,
};

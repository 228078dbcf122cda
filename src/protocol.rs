//! Binary message protocol for the tunnel session
//!
//! Each protocol message rides in exactly one WebSocket binary frame; the
//! transport frame boundary is the length framing, so no inner length field
//! is needed. Message layout:
//!
//! ```text
//! +----------+-------------+--------------------------------------------+
//! | Type(1)  | ConnID(8)   | type-conditional fields                    |
//! +----------+-------------+--------------------------------------------+
//! ```
//!
//! Connect and TokenConnect add `deadline_ms(8) | proto_len(1) proto |
//! addr_len(2) addr`. Data and Error carry the remainder of the frame as
//! payload. AddClient and RemoveClient carry the remainder as the announced
//! `clientKey/sessionKey` address and use connection id 0.

use crate::error::{Result, TunnelError};
use bytes::Bytes;
use std::fmt;

/// Error-frame reason that marks a clean close
pub const EOF_REASON: &str = "EOF";

/// Header size (1 byte type + 8 bytes connection id)
pub const HEADER_SIZE: usize = 9;

/// Message type discriminants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Payload bytes for one virtual connection
    Data = 0x01,
    /// Open a new virtual connection (server -> client)
    Connect = 0x02,
    /// Terminate a virtual connection, carrying the textual cause
    Error = 0x03,
    /// Announce a client reachable through this session (peer mesh)
    AddClient = 0x04,
    /// Withdraw a previously announced client (peer mesh)
    RemoveClient = 0x05,
    /// Open a transient virtual connection for a token request
    TokenConnect = 0x06,
}

impl TryFrom<u8> for MessageType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Connect),
            0x03 => Ok(Self::Error),
            0x04 => Ok(Self::AddClient),
            0x05 => Ok(Self::RemoveClient),
            0x06 => Ok(Self::TokenConnect),
            _ => Err(TunnelError::malformed(format!(
                "unknown message type: 0x{value:02x}"
            ))),
        }
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Payload bytes for one virtual connection
    Data {
        /// Virtual connection id within the session
        conn_id: i64,
        /// Raw payload bytes
        payload: Bytes,
    },

    /// Open a new virtual connection to `proto`/`address`
    Connect {
        /// Virtual connection id chosen by the sender
        conn_id: i64,
        /// Dial timeout on the remote side, in milliseconds
        deadline_ms: u64,
        /// Network protocol ("tcp", or `clientKey::proto` through a peer)
        proto: String,
        /// Target address
        address: String,
    },

    /// Terminate a virtual connection; `reason` is [`EOF_REASON`] when clean
    Error {
        /// Virtual connection id being terminated
        conn_id: i64,
        /// Textual cause of the termination
        reason: String,
    },

    /// Announce a client reachable through this session
    AddClient {
        /// `clientKey/sessionKey` of the announced client
        address: String,
    },

    /// Withdraw a previously announced client
    RemoveClient {
        /// `clientKey/sessionKey` of the withdrawn client
        address: String,
    },

    /// Open a transient virtual connection for a token request
    TokenConnect {
        /// Virtual connection id chosen by the sender
        conn_id: i64,
        /// Response timeout hint, in milliseconds
        deadline_ms: u64,
        /// Token endpoint protocol
        proto: String,
        /// Token endpoint address
        address: String,
    },
}

impl Message {
    /// Get the message type
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Data { .. } => MessageType::Data,
            Self::Connect { .. } => MessageType::Connect,
            Self::Error { .. } => MessageType::Error,
            Self::AddClient { .. } => MessageType::AddClient,
            Self::RemoveClient { .. } => MessageType::RemoveClient,
            Self::TokenConnect { .. } => MessageType::TokenConnect,
        }
    }

    /// Get the virtual connection id this message refers to (0 for
    /// AddClient/RemoveClient, which are session-scoped)
    #[must_use]
    pub const fn conn_id(&self) -> i64 {
        match self {
            Self::Data { conn_id, .. }
            | Self::Connect { conn_id, .. }
            | Self::Error { conn_id, .. }
            | Self::TokenConnect { conn_id, .. } => *conn_id,
            Self::AddClient { .. } | Self::RemoveClient { .. } => 0,
        }
    }

    /// Encode the message to binary format
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 32);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&self.conn_id().to_be_bytes());

        match self {
            Self::Data { payload, .. } => {
                buf.extend_from_slice(payload);
            }

            Self::Connect {
                deadline_ms,
                proto,
                address,
                ..
            }
            | Self::TokenConnect {
                deadline_ms,
                proto,
                address,
                ..
            } => {
                // deadline(8) + proto_len(1) + proto + addr_len(2) + addr
                buf.extend_from_slice(&deadline_ms.to_be_bytes());
                let proto_bytes = proto.as_bytes();
                buf.push(proto_bytes.len() as u8);
                buf.extend_from_slice(proto_bytes);
                let addr_bytes = address.as_bytes();
                buf.extend_from_slice(&(addr_bytes.len() as u16).to_be_bytes());
                buf.extend_from_slice(addr_bytes);
            }

            Self::Error { reason, .. } => {
                buf.extend_from_slice(reason.as_bytes());
            }

            Self::AddClient { address } | Self::RemoveClient { address } => {
                buf.extend_from_slice(address.as_bytes());
            }
        }

        buf
    }

    /// Decode a message from one transport frame
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::MalformedFrame`] if the buffer is shorter than
    /// the header, the type tag is unknown, a required field is missing, or a
    /// string field is not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(TunnelError::malformed(format!(
                "frame too short: {} bytes, need at least {HEADER_SIZE}",
                bytes.len()
            )));
        }

        let msg_type = MessageType::try_from(bytes[0])?;
        let conn_id = i64::from_be_bytes(
            bytes[1..HEADER_SIZE]
                .try_into()
                .map_err(|_| TunnelError::malformed("bad connection id"))?,
        );
        let rest = &bytes[HEADER_SIZE..];

        match msg_type {
            MessageType::Data => Ok(Self::Data {
                conn_id,
                payload: Bytes::copy_from_slice(rest),
            }),
            MessageType::Connect => {
                let (deadline_ms, proto, address) = decode_connect_fields(rest, "Connect")?;
                Ok(Self::Connect {
                    conn_id,
                    deadline_ms,
                    proto,
                    address,
                })
            }
            MessageType::TokenConnect => {
                let (deadline_ms, proto, address) = decode_connect_fields(rest, "TokenConnect")?;
                Ok(Self::TokenConnect {
                    conn_id,
                    deadline_ms,
                    proto,
                    address,
                })
            }
            MessageType::Error => Ok(Self::Error {
                conn_id,
                reason: decode_string(rest, "Error reason")?,
            }),
            MessageType::AddClient => Ok(Self::AddClient {
                address: decode_string(rest, "AddClient address")?,
            }),
            MessageType::RemoveClient => Ok(Self::RemoveClient {
                address: decode_string(rest, "RemoveClient address")?,
            }),
        }
    }
}

/// Decode `deadline(8) + proto_len(1) + proto + addr_len(2) + addr`
fn decode_connect_fields(payload: &[u8], what: &str) -> Result<(u64, String, String)> {
    if payload.len() < 9 {
        return Err(TunnelError::malformed(format!(
            "{what}: payload too short for deadline and proto length"
        )));
    }
    let deadline_ms = u64::from_be_bytes(
        payload[..8]
            .try_into()
            .map_err(|_| TunnelError::malformed(format!("{what}: bad deadline")))?,
    );
    let proto_len = payload[8] as usize;
    if payload.len() < 9 + proto_len + 2 {
        return Err(TunnelError::malformed(format!(
            "{what}: payload too short for proto"
        )));
    }
    let proto = decode_string(&payload[9..9 + proto_len], "proto")?;
    let addr_off = 9 + proto_len;
    let addr_len = u16::from_be_bytes([payload[addr_off], payload[addr_off + 1]]) as usize;
    if payload.len() < addr_off + 2 + addr_len {
        return Err(TunnelError::malformed(format!(
            "{what}: payload too short for address"
        )));
    }
    let address = decode_string(&payload[addr_off + 2..addr_off + 2 + addr_len], "address")?;
    Ok((deadline_ms, proto, address))
}

fn decode_string(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| TunnelError::malformed(format!("{what}: invalid UTF-8: {e}")))
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data { conn_id, payload } => {
                write!(f, "Data[{conn_id}, {} bytes]", payload.len())
            }
            Self::Connect {
                conn_id,
                deadline_ms,
                proto,
                address,
            } => write!(f, "Connect[{conn_id}, {proto}/{address}, {deadline_ms}ms]"),
            Self::Error { conn_id, reason } => write!(f, "Error[{conn_id}, {reason}]"),
            Self::AddClient { address } => write!(f, "AddClient[{address}]"),
            Self::RemoveClient { address } => write!(f, "RemoveClient[{address}]"),
            Self::TokenConnect {
                conn_id,
                deadline_ms,
                proto,
                address,
            } => write!(
                f,
                "TokenConnect[{conn_id}, {proto}/{address}, {deadline_ms}ms]"
            ),
        }
    }
}

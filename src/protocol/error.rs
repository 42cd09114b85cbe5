//! Protocol error types

use std::fmt;

/// High-level protocol errors
///
/// Every variant is fatal to the connection that produced it; none of them
/// takes the broker down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Protocol violation (second CONNECT, malformed filter, ...)
    ProtocolViolation(&'static str),
    /// A server-only packet type arrived from a client
    ServerOnlyPacket(u8),
    /// Packet arrived before CONNECT completed
    NotConnected,
    /// Client identifier rejected
    ClientIdRejected,
    /// Keep alive timeout
    KeepAliveTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::ServerOnlyPacket(t) => {
                write!(f, "server-only packet type {} received from client", t)
            }
            Self::NotConnected => write!(f, "packet received before CONNECT"),
            Self::ClientIdRejected => write!(f, "client identifier rejected"),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

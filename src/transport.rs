//! Transport collaborator interface
//!
//! The broker core never touches bytes: an external transport owns the
//! sockets (TCP, TLS, WebSocket, in-memory for tests) and the packet
//! codec. The core drives it through [`Transport`], addressing individual
//! links by [`ConnectionId`].

use std::fmt;

use async_trait::async_trait;

use crate::protocol::Packet;

/// Opaque identifier for one transport-level connection.
///
/// Allocated by the transport layer; the broker only ever compares and
/// forwards it. Subscription rows hold a `ConnectionId` rather than any
/// connection object, so rows and connections never form reference cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Error surfaced by the transport; always fatal to the connection.
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Outbound side of the transport, as consumed by the broker core.
///
/// `send` delivers a packet to the peer behind `conn`, preserving call
/// order per connection. `close` tears the link down; the transport is
/// expected to report the closure back through
/// [`crate::broker::Broker::on_disconnect`] only for closures it
/// initiates itself, not for ones the broker requested.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, conn: ConnectionId, packet: Packet) -> Result<(), TransportError>;

    async fn close(&self, conn: ConnectionId);
}

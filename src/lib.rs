//! routemq - MQTT v3.1/v3.1.1 broker core
//!
//! The subscription router and per-connection QoS state machines of an
//! MQTT broker, working entirely on parsed packet structs. Transports,
//! packet framing, and process bootstrap live outside this crate and talk
//! to the core through [`broker::Broker`] and [`transport::Transport`].

pub mod broker;
pub mod config;
pub mod inflight;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;

pub use broker::{Broker, BrokerConfig, BrokerEvent, DisconnectReason};
pub use config::Config;
pub use protocol::{Packet, ProtocolVersion, QoS};
pub use transport::{ConnectionId, Transport, TransportError};

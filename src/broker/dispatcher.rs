//! Per-connection inbound event loop
//!
//! Receives the parsed packets the broker routed to this connection,
//! enforces keep-alive (1.5x the CONNECT interval), and forwards work to
//! the state-machine task: publishes, SUBSCRIBE and UNSUBSCRIBE become
//! inflight contexts, acknowledgements become internal events. Protocol
//! violations terminate the connection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::inflight::{AckEvent, QueueCmd};
use crate::protocol::{Packet, ProtocolError, QoS};
use crate::session::Session;
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::ConnectionId;

use super::BrokerInner;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent DISCONNECT
    ClientRequest,
    /// Transport reported an error or the peer vanished
    TransportError,
    /// No traffic within 1.5x the keep-alive interval
    KeepAliveTimeout,
    /// Client broke the protocol
    ProtocolViolation,
    /// A second CONNECT with the same client id displaced this connection
    SessionTakeover,
    /// Broker is shutting down
    Shutdown,
}

impl DisconnectReason {
    /// Abnormal terminations publish the will of a persistent session.
    pub fn is_abnormal(self) -> bool {
        matches!(
            self,
            DisconnectReason::TransportError
                | DisconnectReason::KeepAliveTimeout
                | DisconnectReason::ProtocolViolation
        )
    }
}

/// Command for the dispatcher task.
#[derive(Debug)]
pub(crate) enum DispatchCmd {
    Packet(Packet),
    Stop,
}

enum Route {
    Continue,
    Disconnect,
}

pub(crate) struct Dispatcher {
    inner: Arc<BrokerInner>,
    conn_id: ConnectionId,
    client_id: Arc<str>,
    session: Arc<RwLock<Session>>,
    rx: mpsc::UnboundedReceiver<DispatchCmd>,
    /// The connection's inflight wait handle
    queue: mpsc::UnboundedSender<QueueCmd>,
    /// Keep-alive interval from CONNECT; 0 disables
    keep_alive: u16,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inner: Arc<BrokerInner>,
        conn_id: ConnectionId,
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
        rx: mpsc::UnboundedReceiver<DispatchCmd>,
        queue: mpsc::UnboundedSender<QueueCmd>,
        keep_alive: u16,
    ) -> Self {
        Self {
            inner,
            conn_id,
            client_id,
            session,
            rx,
            queue,
            keep_alive,
        }
    }

    fn keep_alive_window(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_millis(self.keep_alive as u64 * 1500))
    }

    pub async fn run(mut self) {
        let mut deadline = self.keep_alive_window().map(|w| Instant::now() + w);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(DispatchCmd::Packet(packet)) => {
                        {
                            let mut s = self.session.write();
                            s.touch();
                        }
                        deadline = self.keep_alive_window().map(|w| Instant::now() + w);

                        match self.route(packet) {
                            Ok(Route::Continue) => {}
                            Ok(Route::Disconnect) => {
                                debug!(client = %self.client_id, "DISCONNECT");
                                self.inner
                                    .terminate_and_wait(self.conn_id, DisconnectReason::ClientRequest)
                                    .await;
                                break;
                            }
                            Err(e) => {
                                warn!(client = %self.client_id, error = %e, "protocol violation");
                                self.inner
                                    .terminate_and_wait(self.conn_id, DisconnectReason::ProtocolViolation)
                                    .await;
                                break;
                            }
                        }
                    }
                    Some(DispatchCmd::Stop) | None => break,
                },
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    info!(client = %self.client_id, "keep-alive timeout");
                    self.inner
                        .terminate_and_wait(self.conn_id, DisconnectReason::KeepAliveTimeout)
                        .await;
                    break;
                }
            }
        }
    }

    /// Route one inbound packet to the inflight queue, the internal event
    /// queue, or the transport (PINGRESP), per packet type.
    fn route(&self, packet: Packet) -> Result<Route, ProtocolError> {
        match packet {
            Packet::Connect(_) => Err(ProtocolError::ProtocolViolation("duplicate CONNECT")),

            // Server-only packets must never arrive from a client.
            p @ (Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp) => Err(ProtocolError::ServerOnlyPacket(p.packet_type())),

            Packet::Publish(publish) => {
                validate_topic_name(&publish.topic)
                    .map_err(ProtocolError::ProtocolViolation)?;
                if publish.qos != QoS::AtMostOnce && publish.packet_id.is_none() {
                    return Err(ProtocolError::ProtocolViolation(
                        "QoS > 0 PUBLISH without packet id",
                    ));
                }
                self.to_queue(QueueCmd::Inbound(publish));
                Ok(Route::Continue)
            }

            Packet::PubAck(ack) => {
                self.to_queue(QueueCmd::Ack(AckEvent::PubAck(ack.packet_id)));
                Ok(Route::Continue)
            }
            Packet::PubRec(rec) => {
                self.to_queue(QueueCmd::Ack(AckEvent::PubRec(rec.packet_id)));
                Ok(Route::Continue)
            }
            Packet::PubRel(rel) => {
                self.to_queue(QueueCmd::Ack(AckEvent::PubRel(rel.packet_id)));
                Ok(Route::Continue)
            }
            Packet::PubComp(comp) => {
                self.to_queue(QueueCmd::Ack(AckEvent::PubComp(comp.packet_id)));
                Ok(Route::Continue)
            }

            Packet::Subscribe(subscribe) => {
                if subscribe.filters.is_empty() {
                    return Err(ProtocolError::ProtocolViolation("SUBSCRIBE without filters"));
                }
                for sub in &subscribe.filters {
                    validate_topic_filter(&sub.filter)
                        .map_err(ProtocolError::ProtocolViolation)?;
                }
                self.to_queue(QueueCmd::Subscribe(subscribe));
                Ok(Route::Continue)
            }

            Packet::Unsubscribe(unsubscribe) => {
                if unsubscribe.filters.is_empty() {
                    return Err(ProtocolError::ProtocolViolation(
                        "UNSUBSCRIBE without filters",
                    ));
                }
                for filter in &unsubscribe.filters {
                    validate_topic_filter(filter).map_err(ProtocolError::ProtocolViolation)?;
                }
                self.to_queue(QueueCmd::Unsubscribe(unsubscribe));
                Ok(Route::Continue)
            }

            Packet::PingReq => {
                // The worker answers, so the PINGRESP shares the one
                // serialized send path this connection has.
                self.to_queue(QueueCmd::Pong);
                Ok(Route::Continue)
            }

            Packet::Disconnect => Ok(Route::Disconnect),
        }
    }

    fn to_queue(&self, cmd: QueueCmd) {
        let _ = self.queue.send(cmd);
    }
}

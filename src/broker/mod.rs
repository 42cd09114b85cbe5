//! MQTT broker core
//!
//! The [`Broker`] facade is what the surrounding process wires up: the
//! transport feeds parsed packets into [`Broker::on_packet`] and reports
//! link failures through [`Broker::on_disconnect`]; the broker hands
//! outgoing packets back through the [`Transport`] trait.
//!
//! Per connection the broker runs two tasks: the dispatcher (inbound
//! event loop, keep-alive) and the queue worker (inflight queue and QoS
//! state machine). Cross-connection state is limited to the subscription
//! table, the session store, the retained-message map, and the
//! connection registry.

mod dispatcher;
mod publisher;
mod registry;
mod worker;

pub use dispatcher::DisconnectReason;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::inflight::{InflightQueue, QueueCmd};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, Will,
};
use crate::session::{SessionConn, SessionStore};
use crate::topic::SubscriptionTable;
use crate::transport::{ConnectionId, Transport};

use dispatcher::{DispatchCmd, Dispatcher};
use registry::{ConnEntry, ConnectionRegistry};
use worker::QueueWorker;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Retransmission timeout for unacknowledged QoS 1/2 exchanges
    pub retry_interval: Duration,
    /// Retransmissions before a context is abandoned
    pub max_retry: u32,
    /// Cap on concurrently live outbound packet ids per connection
    pub max_packet_ids: u16,
    /// Offline queue bound per persistent session
    pub max_offline_messages: usize,
    /// Granted QoS ceiling
    pub max_qos: QoS,
    /// Whether retained messages are stored and replayed on subscribe
    pub retain_available: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
            max_retry: 3,
            max_packet_ids: u16::MAX,
            max_offline_messages: 1000,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
        }
    }
}

/// Retained message, replayed to new matching subscriptions.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Broker events
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Client completed CONNECT
    ClientConnected { client_id: Arc<str> },
    /// Client connection terminated
    ClientDisconnected { client_id: Arc<str> },
    /// Message passed through fan-out
    MessagePublished { topic: Arc<str>, qos: QoS },
    /// Offline queue overflowed; the oldest message was dropped
    MessageDropped { client_id: Arc<str> },
    /// An outbound exchange was abandoned after max_retry retransmissions
    RetryExhausted { client_id: Arc<str>, packet_id: u16 },
}

/// Shared broker state, behind `Arc` so per-connection tasks can reach it.
pub(crate) struct BrokerInner {
    pub(crate) config: BrokerConfig,
    pub(crate) sessions: SessionStore,
    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) retained: DashMap<Arc<str>, RetainedMessage>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: broadcast::Sender<BrokerEvent>,
}

/// The MQTT broker core.
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let inner = BrokerInner {
            sessions: SessionStore::new(config.max_offline_messages),
            subscriptions: SubscriptionTable::new(config.max_qos),
            retained: DashMap::new(),
            registry: ConnectionRegistry::new(),
            transport,
            events,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Feed one parsed packet from the transport into the core.
    ///
    /// The first packet on a connection must be CONNECT; everything else
    /// is routed to the connection's dispatcher.
    pub async fn on_packet(&self, conn_id: ConnectionId, packet: Packet) {
        match self.inner.registry.get(conn_id) {
            None => match packet {
                Packet::Connect(connect) => {
                    self.inner.clone().handle_connect(conn_id, *connect).await;
                }
                other => {
                    warn!(
                        %conn_id,
                        packet_type = other.packet_type(),
                        "packet before CONNECT, closing"
                    );
                    self.inner.transport.close(conn_id).await;
                }
            },
            Some(entry) => {
                let _ = entry.dispatcher.send(DispatchCmd::Packet(packet));
            }
        }
    }

    /// Transport-initiated disconnect (socket closed, read error, ...).
    ///
    /// When this returns, the connection's tasks have detached: a
    /// persistent session already holds its surviving inflight contexts.
    pub async fn on_disconnect(&self, conn_id: ConnectionId, reason: DisconnectReason) {
        self.inner.terminate_and_wait(conn_id, reason).await;
    }

    /// Broker-originated publish, fanned out like any client publish.
    pub fn publish(&self, topic: Arc<str>, payload: Bytes, qos: QoS, retain: bool) {
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id: None,
            payload,
        };
        self.inner.fan_out(&publish);
    }

    /// Terminate every connection and destroy clean sessions. Persistent
    /// sessions detach; no wills are published.
    pub async fn shutdown(&self) {
        for conn_id in self.inner.registry.all_conns() {
            self.inner
                .terminate_and_wait(conn_id, DisconnectReason::Shutdown)
                .await;
        }
    }

    /// Subscribe to broker events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn retained_count(&self) -> usize {
        self.inner.retained.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }
}

impl BrokerInner {
    /// Handle CONNECT on a fresh connection: displace any previous holder
    /// of the client id, open the session, rehydrate inflight state, and
    /// spawn the connection's tasks.
    async fn handle_connect(self: Arc<Self>, conn_id: ConnectionId, connect: Connect) {
        // [MQTT-3.1.3-8] empty client id is only allowed with a clean session
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(%conn_id, "rejecting empty client id with clean_session=false");
            let connack = ConnAck::refused(ConnectReturnCode::IdentifierRejected);
            let _ = self.transport.send(conn_id, Packet::ConnAck(connack)).await;
            self.transport.close(conn_id).await;
            return;
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!("routemq-{:016x}", rand_id()).into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!(%conn_id, %client_id, clean = connect.clean_session, "CONNECT");

        // Duplicate client id: the old connection gets a clean disconnect
        // (no will) and must finish detaching before we rehydrate.
        if let Some(old) = self.registry.conn_for_client(&client_id) {
            info!(%client_id, old = %old, new = %conn_id, "session takeover");
            self.terminate_and_wait(old, DisconnectReason::SessionTakeover)
                .await;
        }

        let (session, session_present) = self.sessions.open(&client_id, connect.clean_session);
        if connect.clean_session {
            self.subscriptions.unsubscribe_all(&client_id);
        }

        let (dispatcher_tx, dispatcher_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        self.registry.open(
            conn_id,
            ConnEntry {
                client_id: client_id.clone(),
                dispatcher: dispatcher_tx,
                queue: queue_tx.clone(),
            },
        );

        let mut queue = InflightQueue::new(
            self.config.retry_interval,
            self.config.max_retry,
            self.config.max_packet_ids,
        );

        // Attach under one session lock so fan-out sees either the offline
        // queue or the live connection, never a gap between them: saved
        // contexts rehydrate first, then the offline queue drains behind
        // them, then the connection ref becomes visible.
        let keep_alive = connect.keep_alive;
        {
            let mut s = session.write();
            s.clean_session = connect.clean_session;
            s.keep_alive = keep_alive;
            s.will = connect.will.clone();
            s.touch();
            if session_present {
                queue.rehydrate(s.take_inflight(), Instant::now());
                for publish in s.drain_offline() {
                    queue.enqueue_publish(publish);
                }
            }
            s.attach(SessionConn {
                id: conn_id,
                queue: queue_tx.clone(),
            });
        }
        if session_present {
            self.subscriptions.bind_connection(&client_id, Some(conn_id));
        }

        // CONNACK goes out before any queued or rehydrated traffic.
        let connack = ConnAck::accepted(session_present);
        if let Err(e) = self.transport.send(conn_id, Packet::ConnAck(connack)).await {
            warn!(%conn_id, error = %e, "failed to send CONNACK");
            // Hand the rehydrated state back before tearing down.
            let (saved, unsent) = queue.detach();
            {
                let mut s = session.write();
                for ctx in saved {
                    s.persist_inflight(ctx);
                }
                for publish in unsent {
                    s.queue_offline(publish);
                }
            }
            self.terminate(conn_id, DisconnectReason::TransportError).await;
            return;
        }

        let worker = QueueWorker::new(
            self.clone(),
            conn_id,
            client_id.clone(),
            session.clone(),
            queue,
            queue_rx,
        );
        tokio::spawn(worker.run());

        let dispatcher = Dispatcher::new(
            self.clone(),
            conn_id,
            client_id.clone(),
            session,
            dispatcher_rx,
            queue_tx,
            keep_alive,
        );
        tokio::spawn(dispatcher.run());

        let _ = self.events.send(BrokerEvent::ClientConnected { client_id });
    }

    /// Terminate and wait for the state-machine task to finish detaching,
    /// so callers observe a settled session afterwards. The queue worker
    /// itself must use plain [`Self::terminate`] - waiting on its own
    /// teardown would deadlock.
    pub(crate) async fn terminate_and_wait(&self, conn_id: ConnectionId, reason: DisconnectReason) {
        if let Some(done) = self.terminate(conn_id, reason).await {
            let _ = tokio::time::timeout(Duration::from_secs(5), done).await;
        }
    }

    /// Terminate a connection. Idempotent; the first caller performs the
    /// teardown. Returns a receiver that fires once the connection's
    /// state-machine task finished detaching.
    pub(crate) async fn terminate(
        &self,
        conn_id: ConnectionId,
        reason: DisconnectReason,
    ) -> Option<oneshot::Receiver<()>> {
        let entry = self.registry.close(conn_id)?;
        let client_id = entry.client_id.clone();
        debug!(%conn_id, %client_id, ?reason, "terminating connection");

        let _ = entry.dispatcher.send(DispatchCmd::Stop);

        // Unbind the session from this connection and decide on the will.
        let mut clean_session = true;
        let mut will: Option<Will> = None;
        if let Some(session) = self.sessions.get(&client_id) {
            let mut s = session.write();
            if s.connection().map(|c| c.id) == Some(conn_id) {
                s.detach();
            }
            clean_session = s.clean_session;
            let taken = s.will.take();
            if reason.is_abnormal() && !clean_session {
                will = taken;
            }
        }

        // Stop the state machine; persistent sessions keep their contexts.
        let (done_tx, done_rx) = oneshot::channel();
        let _ = entry.queue.send(QueueCmd::Stop {
            persist: !clean_session,
            done: Some(done_tx),
        });

        if clean_session {
            self.subscriptions.unsubscribe_all(&client_id);
            self.sessions.close(&client_id, true);
        } else {
            self.subscriptions.bind_connection(&client_id, None);
        }

        if let Some(will) = will {
            debug!(%client_id, topic = %will.topic, "publishing will message");
            let publish = Publish {
                dup: false,
                qos: will.qos,
                retain: will.retain,
                topic: Arc::from(will.topic.as_str()),
                packet_id: None,
                payload: will.payload,
            };
            self.fan_out(&publish);
        }

        self.transport.close(conn_id).await;
        let _ = self
            .events
            .send(BrokerEvent::ClientDisconnected { client_id });
        Some(done_rx)
    }
}

/// Generate a random id for clients that connect with an empty client id.
fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(COUNTER.fetch_add(1, Ordering::Relaxed));
    hasher.finish()
}

//! Shared test harness
//!
//! The broker core is driven at its real boundary: parsed packets go in
//! through `Broker::on_packet`, and a recording transport captures
//! everything the broker sends back, per connection.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use routemq::protocol::{
    Connect, Packet, Publish, Subscribe, SubscribeFilter, Unsubscribe, Will,
};
use routemq::{Broker, BrokerConfig, ConnectionId, QoS, Transport, TransportError};

/// Opt-in log output for debugging a failing test:
/// `init_logging(); ` at the top of the test body.
pub fn init_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .init();
    });
}

/// Transport stub that records every outbound packet and closure.
pub struct RecordingTransport {
    sent: Mutex<Vec<(ConnectionId, Packet)>>,
    closed: Mutex<Vec<ConnectionId>>,
    notify: Notify,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    /// Remove and return every packet recorded for `conn` so far.
    pub fn drain(&self, conn: ConnectionId) -> Vec<Packet> {
        let mut sent = self.sent.lock();
        let mut taken = Vec::new();
        sent.retain(|(c, p)| {
            if *c == conn {
                taken.push(p.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Packets recorded for `conn`, without consuming them.
    pub fn sent_to(&self, conn: ConnectionId) -> Vec<Packet> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn is_closed(&self, conn: ConnectionId) -> bool {
        self.closed.lock().contains(&conn)
    }

    /// Wait until a packet for `conn` satisfies `pred`, consuming nothing.
    /// Panics after two seconds.
    pub async fn wait_for<F>(&self, conn: ConnectionId, pred: F) -> Packet
    where
        F: Fn(&Packet) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(packet) = self
                .sent_to(conn)
                .into_iter()
                .find(|p| pred(p))
            {
                return packet;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for packet on {:?}; saw {:?}",
                    conn,
                    self.sent_to(conn)
                );
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    /// Wait until the broker closed `conn`. Panics after three seconds
    /// (generous enough for the slowest keep-alive test).
    pub async fn wait_closed(&self, conn: ConnectionId) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !self.is_closed(conn) {
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {:?} to close", conn);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, conn: ConnectionId, packet: Packet) -> Result<(), TransportError> {
        self.sent.lock().push((conn, packet));
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self, conn: ConnectionId) {
        self.closed.lock().push(conn);
        self.notify.notify_waiters();
    }
}

/// A broker wired to a recording transport.
pub struct TestBroker {
    pub broker: Broker,
    pub transport: Arc<RecordingTransport>,
    next_conn: AtomicU64,
}

impl TestBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let transport = RecordingTransport::new();
        Self {
            broker: Broker::new(config, transport.clone()),
            transport,
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(test_config())
    }

    pub fn next_conn_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::SeqCst))
    }

    /// Connect a client and wait for its CONNACK.
    pub async fn connect(&self, client_id: &str, clean_session: bool) -> ConnectionId {
        self.connect_with(client_id, clean_session, None, 0).await
    }

    pub async fn connect_with(
        &self,
        client_id: &str,
        clean_session: bool,
        will: Option<Will>,
        keep_alive: u16,
    ) -> ConnectionId {
        let conn = self.next_conn_id();
        let connect = Connect {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            will,
            ..Connect::default()
        };
        self.broker
            .on_packet(conn, Packet::Connect(Box::new(connect)))
            .await;
        self.transport
            .wait_for(conn, |p| matches!(p, Packet::ConnAck(_)))
            .await;
        conn
    }

    /// Subscribe and wait for the SUBACK.
    pub async fn subscribe(&self, conn: ConnectionId, packet_id: u16, filter: &str, qos: QoS) {
        self.broker
            .on_packet(
                conn,
                Packet::Subscribe(Subscribe {
                    packet_id,
                    filters: vec![SubscribeFilter {
                        filter: filter.to_string(),
                        qos,
                    }],
                }),
            )
            .await;
        self.transport
            .wait_for(conn, |p| {
                matches!(p, Packet::SubAck(s) if s.packet_id == packet_id)
            })
            .await;
    }

    pub async fn unsubscribe(&self, conn: ConnectionId, packet_id: u16, filter: &str) {
        self.broker
            .on_packet(
                conn,
                Packet::Unsubscribe(Unsubscribe {
                    packet_id,
                    filters: vec![filter.to_string()],
                }),
            )
            .await;
        self.transport
            .wait_for(conn, |p| {
                matches!(p, Packet::UnsubAck(u) if u.packet_id == packet_id)
            })
            .await;
    }

    pub async fn publish(
        &self,
        conn: ConnectionId,
        topic: &str,
        payload: &'static [u8],
        qos: QoS,
        packet_id: Option<u16>,
    ) {
        self.broker
            .on_packet(conn, Packet::Publish(publish(topic, payload, qos, packet_id)))
            .await;
    }
}

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        retry_interval: Duration::from_millis(100),
        max_retry: 2,
        ..BrokerConfig::default()
    }
}

pub fn publish(
    topic: &str,
    payload: &'static [u8],
    qos: QoS,
    packet_id: Option<u16>,
) -> Publish {
    Publish {
        dup: false,
        qos,
        retain: false,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::from_static(payload),
    }
}

pub fn will(topic: &str, payload: &'static [u8], qos: QoS) -> Will {
    Will {
        topic: topic.to_string(),
        payload: Bytes::from_static(payload),
        qos,
        retain: false,
    }
}

/// Publishes received on a connection (ignores acks and CONNACK).
pub fn publishes(packets: &[Packet]) -> Vec<&Publish> {
    packets
        .iter()
        .filter_map(|p| match p {
            Packet::Publish(p) => Some(p),
            _ => None,
        })
        .collect()
}

/// Like [`publishes`], but retry retransmissions (DUP=1) filtered out, for
/// exactly-one-copy assertions that must not race the retry timer.
pub fn fresh_publishes(packets: &[Packet]) -> Vec<&Publish> {
    publishes(packets).into_iter().filter(|p| !p.dup).collect()
}

//! Per-connection state-machine task
//!
//! Owns the connection's [`InflightQueue`] outright: commands arrive on an
//! unbounded channel (the inflight wait handle) and the task wakes on
//! either a command or the earliest retransmission deadline, steps the
//! queue, and writes the produced packets to the transport in order.
//! Single ownership is what removes intra-connection locking - nothing
//! else ever touches the queue.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::inflight::{Dispatch, InflightQueue, QueueCmd, StepOutput};
use crate::protocol::{Packet, Publish, Subscribe, SubscribeReturnCode, Unsubscribe};
use crate::session::Session;
use crate::transport::ConnectionId;

use super::dispatcher::DisconnectReason;
use super::{BrokerEvent, BrokerInner};

pub(crate) struct QueueWorker {
    inner: Arc<BrokerInner>,
    conn_id: ConnectionId,
    client_id: Arc<str>,
    session: Arc<RwLock<Session>>,
    queue: InflightQueue,
    rx: mpsc::UnboundedReceiver<QueueCmd>,
    /// Packets answered outside the state machine (PINGRESP), written
    /// ahead of the next step's output on the same serialized path.
    direct: Vec<Packet>,
}

impl QueueWorker {
    pub fn new(
        inner: Arc<BrokerInner>,
        conn_id: ConnectionId,
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
        queue: InflightQueue,
        rx: mpsc::UnboundedReceiver<QueueCmd>,
    ) -> Self {
        Self {
            inner,
            conn_id,
            client_id,
            session,
            queue,
            rx,
            direct: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        loop {
            // Drain whatever is already queued before stepping.
            loop {
                match self.rx.try_recv() {
                    Ok(cmd) => {
                        if self.apply(cmd) {
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                }
            }

            let output = {
                let mut host = WorkerHost {
                    inner: &*self.inner,
                    conn_id: self.conn_id,
                    client_id: &self.client_id,
                    session: &self.session,
                };
                self.queue.step(Instant::now(), &mut host)
            };
            if !self.flush(output).await {
                // Transport failed; termination is underway and the Stop
                // command will arrive on the channel.
                continue;
            }

            // Wake on the inflight handle or the earliest retry deadline.
            let deadline = self.queue.next_deadline();
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.apply(cmd) {
                            return;
                        }
                    }
                    None => return,
                },
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at.into()).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
    }

    /// Apply one command. Returns true when the task should exit.
    fn apply(&mut self, cmd: QueueCmd) -> bool {
        match cmd {
            QueueCmd::Publish(publish) => self.queue.enqueue_publish(publish),
            QueueCmd::Inbound(publish) => self.queue.enqueue_inbound_publish(publish),
            QueueCmd::Subscribe(subscribe) => self.queue.enqueue_subscribe(subscribe),
            QueueCmd::Unsubscribe(unsubscribe) => self.queue.enqueue_unsubscribe(unsubscribe),
            QueueCmd::Ack(event) => self.queue.push_event(event),
            QueueCmd::Pong => self.direct.push(Packet::PingResp),
            QueueCmd::Stop { persist, done } => {
                if persist {
                    let (saved, unsent) = self.queue.detach();
                    if let Some(session) = self.inner.sessions.get(&self.client_id) {
                        let mut s = session.write();
                        for ctx in saved {
                            s.persist_inflight(ctx);
                        }
                        for publish in unsent {
                            s.queue_offline(publish);
                        }
                    }
                }
                debug!(conn = %self.conn_id, client = %self.client_id, "queue worker stopped");
                if let Some(done) = done {
                    let _ = done.send(());
                }
                return true;
            }
        }
        false
    }

    /// Write the step's packets to the transport in order. Returns false
    /// when the transport failed and the connection is being torn down.
    async fn flush(&mut self, output: StepOutput) -> bool {
        for packet_id in output.retry_exhausted {
            let _ = self.inner.events.send(BrokerEvent::RetryExhausted {
                client_id: self.client_id.clone(),
                packet_id,
            });
        }

        let mut packets: Vec<Packet> = self.direct.drain(..).collect();
        packets.extend(output.outgoing);
        for packet in packets {
            if let Err(e) = self.inner.transport.send(self.conn_id, packet).await {
                warn!(conn = %self.conn_id, client = %self.client_id, error = %e, "send failed");
                self.inner
                    .terminate(self.conn_id, DisconnectReason::TransportError)
                    .await;
                return false;
            }
        }
        true
    }
}

/// [`Dispatch`] host wiring the state machine to the broker: deliveries go
/// to the fan-out path, subscription edits hit the table and the session.
struct WorkerHost<'a> {
    inner: &'a BrokerInner,
    conn_id: ConnectionId,
    client_id: &'a Arc<str>,
    session: &'a Arc<RwLock<Session>>,
}

impl Dispatch for WorkerHost<'_> {
    fn deliver(&mut self, publish: &Publish) {
        self.inner.fan_out(publish);
    }

    fn apply_subscribe(
        &mut self,
        subscribe: &Subscribe,
    ) -> (Vec<SubscribeReturnCode>, Vec<Publish>) {
        let mut codes = Vec::with_capacity(subscribe.filters.len());
        let mut retained = Vec::new();

        for sub in &subscribe.filters {
            let granted = self.inner.subscriptions.subscribe(
                self.client_id,
                &sub.filter,
                sub.qos,
                Some(self.conn_id),
            );
            {
                let mut s = self.session.write();
                s.add_subscription(Arc::from(sub.filter.as_str()), granted);
            }
            debug!(
                client = %self.client_id,
                filter = %sub.filter,
                qos = ?granted,
                "subscribed"
            );
            codes.push(SubscribeReturnCode::granted(granted));
            retained.extend(self.inner.retained_for(&sub.filter, granted));
        }

        (codes, retained)
    }

    fn apply_unsubscribe(&mut self, unsubscribe: &Unsubscribe) {
        for filter in &unsubscribe.filters {
            let removed = self.inner.subscriptions.unsubscribe(self.client_id, filter);
            {
                let mut s = self.session.write();
                s.remove_subscription(filter);
            }
            debug!(
                client = %self.client_id,
                filter = %filter,
                removed,
                "unsubscribed"
            );
        }
    }
}

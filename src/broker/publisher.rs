//! Outbound fan-out
//!
//! Invoked whenever an inbound PUBLISH completes (or the broker publishes
//! on its own behalf): queries the subscription table, collapses the
//! matches by client at their maximum granted QoS, and enqueues one copy
//! per client at `min(publish_qos, granted_qos)`. Offline persistent
//! sessions queue the copy instead, for effective QoS 1/2 only.
//!
//! The table lock is released before any session is touched; nothing here
//! performs I/O - live targets receive their copy through the connection's
//! inflight wait handle.

use std::sync::Arc;

use ahash::AHashMap;
use tracing::trace;

use crate::inflight::QueueCmd;
use crate::protocol::{Publish, QoS};
use crate::session::QueueResult;
use crate::topic::topic_matches_filter;

use super::{BrokerEvent, BrokerInner, RetainedMessage};

impl BrokerInner {
    /// Fan a publish out to every matching subscriber.
    pub(crate) fn fan_out(&self, publish: &Publish) {
        if publish.retain && self.config.retain_available {
            self.store_retained(publish);
        }

        let rows = self.subscriptions.find_subscribers(&publish.topic);

        // One copy per client at the maximum granted QoS across its
        // matching filters. The projection replaces any per-row dispatch:
        // overlapping filters must never produce duplicates.
        let mut per_client: AHashMap<Arc<str>, QoS> = AHashMap::with_capacity(rows.len());
        for row in &rows {
            let entry = per_client
                .entry(row.client_id.clone())
                .or_insert(QoS::AtMostOnce);
            if row.qos > *entry {
                *entry = row.qos;
            }
        }

        for (client_id, granted) in per_client {
            let effective = publish.qos.min(granted);
            let Some(session) = self.sessions.get(&client_id) else {
                continue;
            };

            let outgoing = Publish {
                dup: false,
                qos: effective,
                // [MQTT-3.3.1-9] retain is cleared on live delivery to an
                // established subscription
                retain: false,
                topic: publish.topic.clone(),
                packet_id: None,
                payload: publish.payload.clone(),
            };

            let mut s = session.write();
            match s.connection() {
                Some(conn) => {
                    trace!(%client_id, topic = %outgoing.topic, qos = ?effective, "fan-out");
                    let _ = conn.queue.send(QueueCmd::Publish(outgoing));
                }
                None => {
                    // Queue for reconnect, but only for persistent sessions
                    // and only at effective QoS 1/2.
                    if !s.clean_session && effective != QoS::AtMostOnce {
                        trace!(%client_id, topic = %outgoing.topic, "queueing offline");
                        if s.queue_offline(outgoing) == QueueResult::DroppedOldest {
                            let _ = self.events.send(BrokerEvent::MessageDropped {
                                client_id: client_id.clone(),
                            });
                        }
                    }
                }
            }
        }

        let _ = self.events.send(BrokerEvent::MessagePublished {
            topic: publish.topic.clone(),
            qos: publish.qos,
        });
    }

    /// Retained messages matching a freshly granted filter, ready to
    /// enqueue behind the SUBACK. Delivered with the retain flag set and
    /// at `min(retained_qos, granted_qos)`.
    pub(crate) fn retained_for(&self, filter: &str, granted: QoS) -> Vec<Publish> {
        if !self.config.retain_available {
            return Vec::new();
        }
        self.retained
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| {
                let msg: &RetainedMessage = entry.value();
                Publish {
                    dup: false,
                    qos: msg.qos.min(granted),
                    retain: true,
                    topic: msg.topic.clone(),
                    packet_id: None,
                    payload: msg.payload.clone(),
                }
            })
            .collect()
    }

    fn store_retained(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            // A zero-byte retained publish clears the slot; it still fans
            // out to current subscribers like any other message.
            self.retained.remove(&publish.topic);
        } else {
            self.retained.insert(
                publish.topic.clone(),
                RetainedMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                },
            );
        }
    }
}

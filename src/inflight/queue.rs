//! The inflight queue proper: FIFO context storage, acknowledgement
//! application, and the state-machine walk.
//!
//! The owning task calls [`InflightQueue::step`] on every wake. A step
//! first applies queued acknowledgement events, then walks the contexts in
//! FIFO order and advances each one as far as its preconditions allow,
//! collecting outgoing packets. Packets reach the transport in the order
//! their contexts hit a send transition, which preserves per-subscriber
//! PUBLISH ordering.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::protocol::{
    Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, UnsubAck, Unsubscribe,
};

use super::{DeliveryState, Flow, PacketIdAllocator, SavedContext};

/// Acknowledgement received from the client, queued on the internal event
/// queue by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
}

/// Host callbacks the state machine needs while stepping.
///
/// Implemented by the broker's connection worker; test code supplies mock
/// implementations to drive the machine in isolation. None of these may
/// block or perform I/O.
pub(crate) trait Dispatch {
    /// Hand a completed inbound PUBLISH to the fan-out path.
    fn deliver(&mut self, publish: &Publish);

    /// Apply subscription edits. Returns the granted return codes in
    /// request order plus any retained messages to enqueue after the
    /// SUBACK.
    fn apply_subscribe(&mut self, subscribe: &Subscribe)
        -> (Vec<SubscribeReturnCode>, Vec<Publish>);

    /// Apply unsubscription edits.
    fn apply_unsubscribe(&mut self, unsubscribe: &Unsubscribe);
}

/// What a [`InflightQueue::step`] produced.
#[derive(Debug, Default)]
pub(crate) struct StepOutput {
    /// Packets to hand to the transport, in order.
    pub outgoing: Vec<Packet>,
    /// Packet ids whose contexts were abandoned after `max_retry`
    /// unanswered retransmissions.
    pub retry_exhausted: Vec<u16>,
}

#[derive(Debug, Clone)]
enum ContextMessage {
    Publish(Publish),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
}

#[derive(Debug)]
struct MsgContext {
    packet_id: Option<u16>,
    flow: Flow,
    message: ContextMessage,
    state: DeliveryState,
    /// Retransmissions performed so far in the current wait state
    attempt: u32,
    deadline: Option<Instant>,
    /// Inbound publish already handed to the fan-out path
    delivered: bool,
    /// Granted codes stashed between SendSubscribe and SendSuback
    granted: Option<Vec<SubscribeReturnCode>>,
}

impl MsgContext {
    fn publish(&self) -> &Publish {
        match &self.message {
            ContextMessage::Publish(p) => p,
            _ => unreachable!("context is not a publish"),
        }
    }
}

/// One connection's inflight queue: the FIFO context queue, the internal
/// event queue, and the outbound packet-id allocator.
pub(crate) struct InflightQueue {
    queue: VecDeque<MsgContext>,
    events: VecDeque<AckEvent>,
    alloc: PacketIdAllocator,
    /// PUBREL ids whose context already completed; answered with a bare
    /// PUBCOMP on the next step.
    orphan_pubrel: Vec<u16>,
    retry_interval: Duration,
    max_retry: u32,
}

impl InflightQueue {
    pub fn new(retry_interval: Duration, max_retry: u32, id_cap: u16) -> Self {
        Self {
            queue: VecDeque::new(),
            events: VecDeque::new(),
            alloc: PacketIdAllocator::new(id_cap),
            orphan_pubrel: Vec::new(),
            retry_interval,
            max_retry,
        }
    }

    /// Enqueue an outbound PUBLISH (flow `ToPublish`). The publish carries
    /// its effective QoS already; a packet id is allocated at the send
    /// transition.
    pub fn enqueue_publish(&mut self, publish: Publish) {
        let state = match publish.qos {
            QoS::AtMostOnce => DeliveryState::QueuedQos0,
            QoS::AtLeastOnce => DeliveryState::QueuedQos1,
            QoS::ExactlyOnce => DeliveryState::QueuedQos2,
        };
        self.queue.push_back(MsgContext {
            packet_id: None,
            flow: Flow::ToPublish,
            message: ContextMessage::Publish(publish),
            state,
            attempt: 0,
            deadline: None,
            delivered: false,
            granted: None,
        });
    }

    /// Enqueue an inbound PUBLISH (flow `ToAcknowledge`).
    ///
    /// A QoS 2 publish whose `(packet_id, ToAcknowledge)` context already
    /// exists is a publisher-side retransmission: the context is re-armed
    /// so a fresh PUBREC goes out, but the message is not delivered again.
    pub fn enqueue_inbound_publish(&mut self, publish: Publish) {
        if publish.qos == QoS::ExactlyOnce {
            if let Some(id) = publish.packet_id {
                if let Some(ctx) = self.find_publish_mut(id, Flow::ToAcknowledge) {
                    trace!(packet_id = id, "duplicate QoS 2 PUBLISH, re-arming PUBREC");
                    ctx.state = DeliveryState::QueuedQos2;
                    ctx.deadline = None;
                    return;
                }
            }
        }

        let state = match publish.qos {
            QoS::AtMostOnce => DeliveryState::QueuedQos0,
            QoS::AtLeastOnce => DeliveryState::QueuedQos1,
            QoS::ExactlyOnce => DeliveryState::QueuedQos2,
        };
        self.queue.push_back(MsgContext {
            packet_id: publish.packet_id,
            flow: Flow::ToAcknowledge,
            message: ContextMessage::Publish(publish),
            state,
            attempt: 0,
            deadline: None,
            delivered: false,
            granted: None,
        });
    }

    /// Enqueue an inbound SUBSCRIBE request.
    pub fn enqueue_subscribe(&mut self, subscribe: Subscribe) {
        self.queue.push_back(MsgContext {
            packet_id: Some(subscribe.packet_id),
            flow: Flow::ToAcknowledge,
            message: ContextMessage::Subscribe(subscribe),
            state: DeliveryState::SendSubscribe,
            attempt: 0,
            deadline: None,
            delivered: false,
            granted: None,
        });
    }

    /// Enqueue an inbound UNSUBSCRIBE request.
    pub fn enqueue_unsubscribe(&mut self, unsubscribe: Unsubscribe) {
        self.queue.push_back(MsgContext {
            packet_id: Some(unsubscribe.packet_id),
            flow: Flow::ToAcknowledge,
            message: ContextMessage::Unsubscribe(unsubscribe),
            state: DeliveryState::SendUnsubscribe,
            attempt: 0,
            deadline: None,
            delivered: false,
            granted: None,
        });
    }

    /// Enqueue an acknowledgement on the internal event queue.
    pub fn push_event(&mut self, event: AckEvent) {
        self.events.push_back(event);
    }

    /// Earliest pending retransmission deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.iter().filter_map(|c| c.deadline).min()
    }

    /// Whether no contexts, events, or orphan acks remain.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.events.is_empty() && self.orphan_pubrel.is_empty()
    }

    /// Whether a context with `(packet_id, flow)` is live (invariant
    /// checks in tests).
    #[cfg(test)]
    pub fn contains(&self, packet_id: u16, flow: Flow) -> bool {
        self.queue
            .iter()
            .any(|c| c.packet_id == Some(packet_id) && c.flow == flow)
    }

    /// Apply pending events and advance every context whose preconditions
    /// are met.
    pub fn step(&mut self, now: Instant, host: &mut dyn Dispatch) -> StepOutput {
        let mut out = StepOutput::default();

        while let Some(event) = self.events.pop_front() {
            self.apply_event(event);
        }

        // Completed QoS 2 exchanges still get their PUBREL answered.
        for id in self.orphan_pubrel.drain(..) {
            out.outgoing.push(Packet::PubComp(PubComp::new(id)));
        }

        let mut append: Vec<Publish> = Vec::new();
        loop {
            let mut i = 0;
            let mut id_starved = false;
            let mut id_released = false;
            while i < self.queue.len() {
                while self.advance(i, now, host, &mut id_starved, &mut out, &mut append) {}

                // Retained messages surfaced by a SUBSCRIBE go behind the
                // SUBACK, at the queue tail; the walk picks them up below.
                for publish in append.drain(..) {
                    self.enqueue_publish(publish);
                }

                if self.queue[i].state == DeliveryState::Finished {
                    if let Some(ctx) = self.queue.remove(i) {
                        if ctx.flow == Flow::ToPublish {
                            if let Some(id) = ctx.packet_id {
                                self.alloc.release(id);
                                id_released = true;
                            }
                        }
                    }
                } else {
                    i += 1;
                }
            }

            // A context further back may have freed an id a starved
            // publish in front of it was waiting for; walk again rather
            // than stalling until the next wake.
            if !(id_starved && id_released) {
                break;
            }
        }

        out
    }

    /// Advance the context at `i` by one transition. Returns whether it
    /// moved and may move again.
    fn advance(
        &mut self,
        i: usize,
        now: Instant,
        host: &mut dyn Dispatch,
        id_starved: &mut bool,
        out: &mut StepOutput,
        append: &mut Vec<Publish>,
    ) -> bool {
        let retry_interval = self.retry_interval;
        let max_retry = self.max_retry;
        let alloc = &mut self.alloc;
        let ctx = &mut self.queue[i];
        let expired = |deadline: Option<Instant>| deadline.is_some_and(|d| d <= now);

        match (ctx.flow, ctx.state) {
            (_, DeliveryState::Finished) => false,

            // Outbound publish
            (Flow::ToPublish, DeliveryState::QueuedQos0) => {
                let mut publish = ctx.publish().clone();
                publish.dup = false;
                publish.packet_id = None;
                out.outgoing.push(Packet::Publish(publish));
                ctx.state = DeliveryState::Finished;
                false
            }
            (Flow::ToPublish, DeliveryState::QueuedQos1 | DeliveryState::QueuedQos2) => {
                // Keep per-subscriber order: once one outbound publish is
                // starved of an id, everything behind it waits too.
                if *id_starved {
                    return false;
                }
                let id = match ctx.packet_id.or_else(|| alloc.allocate()) {
                    Some(id) => id,
                    None => {
                        debug!("packet id space exhausted, backpressuring outbound publishes");
                        *id_starved = true;
                        return false;
                    }
                };
                ctx.packet_id = Some(id);
                let mut publish = ctx.publish().clone();
                publish.dup = false;
                publish.packet_id = Some(id);
                out.outgoing.push(Packet::Publish(publish));
                ctx.state = if ctx.state == DeliveryState::QueuedQos1 {
                    DeliveryState::WaitForPuback
                } else {
                    DeliveryState::WaitForPubrec
                };
                ctx.deadline = Some(now + retry_interval);
                false
            }
            (
                Flow::ToPublish,
                DeliveryState::WaitForPuback | DeliveryState::WaitForPubrec,
            ) => {
                if !expired(ctx.deadline) {
                    return false;
                }
                let Some(id) = ctx.packet_id else {
                    debug!(state = ?ctx.state, "context missing packet id, dropping");
                    ctx.state = DeliveryState::Finished;
                    return false;
                };
                if ctx.attempt >= max_retry {
                    warn!(
                        packet_id = id,
                        attempts = ctx.attempt,
                        "PUBLISH retries exhausted, dropping context"
                    );
                    out.retry_exhausted.push(id);
                    ctx.state = DeliveryState::Finished;
                    return true;
                }
                let mut publish = ctx.publish().clone();
                publish.dup = true;
                publish.packet_id = Some(id);
                out.outgoing.push(Packet::Publish(publish));
                ctx.attempt += 1;
                ctx.deadline = Some(now + retry_interval);
                false
            }
            (Flow::ToPublish, DeliveryState::SendPubrel) => {
                let Some(id) = ctx.packet_id else {
                    debug!(state = ?ctx.state, "context missing packet id, dropping");
                    ctx.state = DeliveryState::Finished;
                    return false;
                };
                out.outgoing.push(Packet::PubRel(PubRel::new(id)));
                ctx.state = DeliveryState::WaitForPubcomp;
                ctx.deadline = Some(now + retry_interval);
                false
            }
            (Flow::ToPublish, DeliveryState::WaitForPubcomp) => {
                if !expired(ctx.deadline) {
                    return false;
                }
                let Some(id) = ctx.packet_id else {
                    debug!(state = ?ctx.state, "context missing packet id, dropping");
                    ctx.state = DeliveryState::Finished;
                    return false;
                };
                if ctx.attempt >= max_retry {
                    warn!(
                        packet_id = id,
                        attempts = ctx.attempt,
                        "PUBREL retries exhausted, dropping context"
                    );
                    out.retry_exhausted.push(id);
                    ctx.state = DeliveryState::Finished;
                    return true;
                }
                out.outgoing.push(Packet::PubRel(PubRel {
                    packet_id: id,
                    dup: true,
                }));
                ctx.attempt += 1;
                ctx.deadline = Some(now + retry_interval);
                false
            }

            // Inbound publish
            (Flow::ToAcknowledge, DeliveryState::QueuedQos0) => {
                host.deliver(ctx.publish());
                ctx.state = DeliveryState::Finished;
                false
            }
            (Flow::ToAcknowledge, DeliveryState::QueuedQos1) => {
                host.deliver(ctx.publish());
                ctx.state = DeliveryState::SendPuback;
                true
            }
            (Flow::ToAcknowledge, DeliveryState::SendPuback) => {
                let Some(id) = ctx.packet_id else {
                    debug!(state = ?ctx.state, "context missing packet id, dropping");
                    ctx.state = DeliveryState::Finished;
                    return false;
                };
                out.outgoing.push(Packet::PubAck(PubAck::new(id)));
                ctx.state = DeliveryState::Finished;
                false
            }
            (Flow::ToAcknowledge, DeliveryState::QueuedQos2) => {
                if !ctx.delivered {
                    host.deliver(ctx.publish());
                    ctx.delivered = true;
                }
                ctx.state = DeliveryState::SendPubrec;
                true
            }
            (Flow::ToAcknowledge, DeliveryState::SendPubrec) => {
                let Some(id) = ctx.packet_id else {
                    debug!(state = ?ctx.state, "context missing packet id, dropping");
                    ctx.state = DeliveryState::Finished;
                    return false;
                };
                out.outgoing.push(Packet::PubRec(PubRec::new(id)));
                ctx.state = DeliveryState::WaitForPubrel;
                ctx.deadline = Some(now + retry_interval);
                false
            }
            (Flow::ToAcknowledge, DeliveryState::WaitForPubrel) => {
                if !expired(ctx.deadline) {
                    return false;
                }
                let Some(id) = ctx.packet_id else {
                    debug!(state = ?ctx.state, "context missing packet id, dropping");
                    ctx.state = DeliveryState::Finished;
                    return false;
                };
                if ctx.attempt >= max_retry {
                    warn!(
                        packet_id = id,
                        attempts = ctx.attempt,
                        "PUBREC retries exhausted, dropping context"
                    );
                    out.retry_exhausted.push(id);
                    ctx.state = DeliveryState::Finished;
                    return true;
                }
                out.outgoing.push(Packet::PubRec(PubRec::new(id)));
                ctx.attempt += 1;
                ctx.deadline = Some(now + retry_interval);
                false
            }
            (Flow::ToAcknowledge, DeliveryState::SendPubcomp) => {
                let Some(id) = ctx.packet_id else {
                    debug!(state = ?ctx.state, "context missing packet id, dropping");
                    ctx.state = DeliveryState::Finished;
                    return false;
                };
                out.outgoing.push(Packet::PubComp(PubComp::new(id)));
                ctx.state = DeliveryState::Finished;
                false
            }

            // Inbound subscription edits
            (Flow::ToAcknowledge, DeliveryState::SendSubscribe) => {
                let ContextMessage::Subscribe(subscribe) = &ctx.message else {
                    unreachable!("SendSubscribe context is a subscribe");
                };
                let (codes, retained) = host.apply_subscribe(subscribe);
                ctx.granted = Some(codes);
                append.extend(retained);
                ctx.state = DeliveryState::SendSuback;
                true
            }
            (Flow::ToAcknowledge, DeliveryState::SendSuback) => {
                let Some(id) = ctx.packet_id else {
                    debug!(state = ?ctx.state, "context missing packet id, dropping");
                    ctx.state = DeliveryState::Finished;
                    return false;
                };
                out.outgoing.push(Packet::SubAck(SubAck {
                    packet_id: id,
                    return_codes: ctx.granted.take().unwrap_or_default(),
                }));
                ctx.state = DeliveryState::Finished;
                false
            }
            (Flow::ToAcknowledge, DeliveryState::SendUnsubscribe) => {
                let ContextMessage::Unsubscribe(unsubscribe) = &ctx.message else {
                    unreachable!("SendUnsubscribe context is an unsubscribe");
                };
                host.apply_unsubscribe(unsubscribe);
                ctx.state = DeliveryState::SendUnsuback;
                true
            }
            (Flow::ToAcknowledge, DeliveryState::SendUnsuback) => {
                let Some(id) = ctx.packet_id else {
                    debug!(state = ?ctx.state, "context missing packet id, dropping");
                    ctx.state = DeliveryState::Finished;
                    return false;
                };
                out.outgoing.push(Packet::UnsubAck(UnsubAck { packet_id: id }));
                ctx.state = DeliveryState::Finished;
                false
            }

            // Remaining combinations cannot arise from the enqueue paths.
            (flow, state) => {
                debug!(?flow, ?state, "context in unexpected state, dropping");
                ctx.state = DeliveryState::Finished;
                false
            }
        }
    }

    fn apply_event(&mut self, event: AckEvent) {
        match event {
            AckEvent::PubAck(id) => match self.find_publish_mut(id, Flow::ToPublish) {
                Some(ctx) if ctx.state == DeliveryState::WaitForPuback => {
                    ctx.state = DeliveryState::Finished;
                }
                Some(ctx) => trace!(packet_id = id, state = ?ctx.state, "unexpected PUBACK"),
                None => trace!(packet_id = id, "PUBACK without context, dropped"),
            },
            AckEvent::PubRec(id) => match self.find_publish_mut(id, Flow::ToPublish) {
                Some(ctx) if ctx.state == DeliveryState::WaitForPubrec => {
                    ctx.state = DeliveryState::SendPubrel;
                    ctx.attempt = 0;
                    ctx.deadline = None;
                }
                Some(ctx) => trace!(packet_id = id, state = ?ctx.state, "unexpected PUBREC"),
                // Original PUBLISH exceeded retries and was abandoned
                None => trace!(packet_id = id, "PUBREC without context, dropped"),
            },
            AckEvent::PubComp(id) => match self.find_publish_mut(id, Flow::ToPublish) {
                Some(ctx) if ctx.state == DeliveryState::WaitForPubcomp => {
                    ctx.state = DeliveryState::Finished;
                }
                Some(ctx) => trace!(packet_id = id, state = ?ctx.state, "unexpected PUBCOMP"),
                None => trace!(packet_id = id, "PUBCOMP without context, dropped"),
            },
            AckEvent::PubRel(id) => match self.find_publish_mut(id, Flow::ToAcknowledge) {
                Some(ctx)
                    if matches!(
                        ctx.state,
                        DeliveryState::WaitForPubrel | DeliveryState::SendPubrec
                    ) =>
                {
                    ctx.state = DeliveryState::SendPubcomp;
                    ctx.deadline = None;
                }
                Some(ctx) => trace!(packet_id = id, state = ?ctx.state, "unexpected PUBREL"),
                // The exchange already completed; acknowledge without
                // delivering again.
                None => self.orphan_pubrel.push(id),
            },
        }
    }

    fn find_publish_mut(&mut self, packet_id: u16, flow: Flow) -> Option<&mut MsgContext> {
        self.queue.iter_mut().find(|c| {
            c.packet_id == Some(packet_id)
                && c.flow == flow
                && matches!(c.message, ContextMessage::Publish(_))
                && c.state != DeliveryState::Finished
        })
    }

    /// Tear the queue down for connection termination.
    ///
    /// Returns the PUBLISH contexts that already hold a packet id (to be
    /// persisted in the session under their `(packet_id, flow)` keys) and
    /// the outbound QoS 1/2 publishes that never got one (to be re-queued
    /// on the session's offline queue). Everything else is dropped.
    pub fn detach(&mut self) -> (Vec<SavedContext>, Vec<Publish>) {
        let mut saved = Vec::new();
        let mut unsent = Vec::new();
        for ctx in self.queue.drain(..) {
            let ContextMessage::Publish(publish) = ctx.message else {
                continue;
            };
            match ctx.packet_id {
                Some(packet_id) => saved.push(SavedContext {
                    packet_id,
                    flow: ctx.flow,
                    state: ctx.state,
                    attempt: ctx.attempt,
                    delivered: ctx.delivered,
                    publish,
                }),
                None if ctx.flow == Flow::ToPublish && publish.qos != QoS::AtMostOnce => {
                    unsent.push(publish);
                }
                None => {}
            }
        }
        self.events.clear();
        self.orphan_pubrel.clear();
        (saved, unsent)
    }

    /// Rebuild contexts from a resumed session, preserving packet ids and
    /// states. Waiting contexts get an already-expired deadline so the
    /// first step retransmits immediately, with DUP set.
    pub fn rehydrate(&mut self, saved: Vec<SavedContext>, now: Instant) {
        for s in saved {
            if s.flow == Flow::ToPublish {
                self.alloc.reserve(s.packet_id);
            }
            let deadline = match s.state {
                DeliveryState::WaitForPuback
                | DeliveryState::WaitForPubrec
                | DeliveryState::WaitForPubcomp
                | DeliveryState::WaitForPubrel => Some(now),
                _ => None,
            };
            self.queue.push_back(MsgContext {
                packet_id: Some(s.packet_id),
                flow: s.flow,
                message: ContextMessage::Publish(s.publish),
                state: s.state,
                attempt: s.attempt,
                deadline,
                delivered: s.delivered,
                granted: None,
            });
        }
    }
}

//! Per-connection inflight queue and QoS state machine
//!
//! Each connection owns one FIFO queue of message contexts plus one
//! internal event queue for acknowledgements. A dedicated task
//! ([`crate::broker`]'s connection worker) wakes whenever a context or
//! event is enqueued, or when the earliest retransmission deadline
//! expires, and advances every context whose preconditions are met.
//!
//! This module is deliberately synchronous: the queue is owned by exactly
//! one task, so the state machine is plain single-threaded code that the
//! unit tests can drive step by step.

mod alloc;
mod queue;

pub(crate) use alloc::PacketIdAllocator;
pub(crate) use queue::{Dispatch, InflightQueue, StepOutput};
pub use queue::AckEvent;

use tokio::sync::oneshot;

use crate::protocol::{Publish, Subscribe, Unsubscribe};

/// Command sent to a connection's state-machine task. The sending side of
/// the channel doubles as the inflight wait handle: pushing a command
/// wakes the task.
#[derive(Debug)]
pub enum QueueCmd {
    /// Enqueue an outbound publish (flow `ToPublish`)
    Publish(Publish),
    /// Enqueue an inbound publish (flow `ToAcknowledge`)
    Inbound(Publish),
    /// Enqueue an inbound SUBSCRIBE request
    Subscribe(Subscribe),
    /// Enqueue an inbound UNSUBSCRIBE request
    Unsubscribe(Unsubscribe),
    /// Enqueue an acknowledgement on the internal event queue
    Ack(AckEvent),
    /// Answer a PINGREQ. Routed through the state-machine task so the
    /// PINGRESP serializes with every other outbound packet.
    Pong,
    /// Stop the task; persist surviving contexts into the session when
    /// `persist` is set. `done` fires once teardown completed.
    Stop {
        persist: bool,
        done: Option<oneshot::Sender<()>>,
    },
}

/// Direction of a message context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Flow {
    /// Broker -> client: we publish, the client acknowledges
    ToPublish,
    /// Client -> broker: the client published, we acknowledge
    ToAcknowledge,
}

/// `(packet_id, flow)` uniquely identifies an active inflight context
/// within one session.
pub type MsgKey = (u16, Flow);

/// Delivery state of a message context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    QueuedQos0,
    QueuedQos1,
    QueuedQos2,
    WaitForPuback,
    WaitForPubrec,
    WaitForPubrel,
    WaitForPubcomp,
    SendSubscribe,
    SendSuback,
    SendUnsubscribe,
    SendUnsuback,
    SendPubrec,
    SendPubrel,
    SendPubcomp,
    SendPuback,
    Finished,
}

/// Snapshot of a PUBLISH context, as persisted in the session store while
/// the client is disconnected and rehydrated on reconnect with the
/// original packet id and state.
#[derive(Debug, Clone)]
pub struct SavedContext {
    pub packet_id: u16,
    pub flow: Flow,
    pub state: DeliveryState,
    pub attempt: u32,
    pub delivered: bool,
    pub publish: Publish,
}

impl SavedContext {
    pub fn key(&self) -> MsgKey {
        (self.packet_id, self.flow)
    }
}

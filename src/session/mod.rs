//! MQTT session management
//!
//! A session carries the per-client state that outlives any single
//! connection: granted subscriptions, saved inflight contexts keyed by
//! `(packet_id, flow)`, the offline message queue, and the will message.
//! `clean_session=true` sessions are created fresh on CONNECT and
//! destroyed on disconnect; persistent sessions survive and queue
//! offline messages for their QoS 1/2 subscriptions.
//!
//! The store is keyed by client id; each session sits behind its own
//! lock, which is enough because session ownership moves atomically on
//! reconnect.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::inflight::{MsgKey, QueueCmd, SavedContext};
use crate::protocol::{Publish, QoS, Will};
use crate::transport::ConnectionId;

/// Result of queueing an offline message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    Queued,
    /// The queue was full; the oldest message was dropped to make room.
    DroppedOldest,
}

/// Live connection binding held by a connected session.
///
/// The sender is the connection's inflight wait handle: pushing a command
/// wakes the state-machine task that owns the queue.
#[derive(Debug, Clone)]
pub struct SessionConn {
    pub id: ConnectionId,
    pub queue: mpsc::UnboundedSender<QueueCmd>,
}

/// Per-client session state.
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Clean session flag from the latest CONNECT
    pub clean_session: bool,
    /// Keep alive interval in seconds (0 disables)
    pub keep_alive: u16,
    /// Last communication timestamp
    pub last_comm: Instant,
    /// Granted subscriptions: filter -> granted QoS
    pub subscriptions: AHashMap<Arc<str>, QoS>,
    /// Saved inflight contexts, in their original enqueue order. The
    /// `(packet_id, flow)` key is unique within the vector.
    inflight: Vec<SavedContext>,
    /// Messages queued while the client is offline, oldest first
    offline: VecDeque<Publish>,
    /// Offline queue bound
    max_offline: usize,
    /// Will message from CONNECT
    pub will: Option<Will>,
    /// Live connection, absent while the client is disconnected
    conn: Option<SessionConn>,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_session: bool, max_offline: usize) -> Self {
        Self {
            client_id,
            clean_session,
            keep_alive: 0,
            last_comm: Instant::now(),
            subscriptions: AHashMap::with_capacity(8),
            inflight: Vec::new(),
            offline: VecDeque::new(),
            max_offline,
            will: None,
            conn: None,
        }
    }

    /// Update the last-communication timestamp.
    pub fn touch(&mut self) {
        self.last_comm = Instant::now();
    }

    /// Whether keep-alive has lapsed (1.5x the negotiated interval).
    pub fn keep_alive_expired(&self, now: Instant) -> bool {
        if self.keep_alive == 0 {
            return false;
        }
        let timeout = Duration::from_millis(self.keep_alive as u64 * 1500);
        now.duration_since(self.last_comm) > timeout
    }

    /// Bind the session to a live connection.
    pub fn attach(&mut self, conn: SessionConn) {
        self.conn = Some(conn);
    }

    /// Drop the connection binding (the session itself may persist).
    pub fn detach(&mut self) {
        self.conn = None;
    }

    pub fn connection(&self) -> Option<&SessionConn> {
        self.conn.as_ref()
    }

    /// Persist one inflight context under its `(packet_id, flow)` key,
    /// replacing any context already saved under that key.
    pub fn persist_inflight(&mut self, ctx: SavedContext) {
        let key = ctx.key();
        if let Some(existing) = self.inflight.iter_mut().find(|c| c.key() == key) {
            *existing = ctx;
        } else {
            self.inflight.push(ctx);
        }
    }

    /// Remove a saved inflight context.
    pub fn remove_inflight(&mut self, key: MsgKey) -> Option<SavedContext> {
        let pos = self.inflight.iter().position(|c| c.key() == key)?;
        Some(self.inflight.remove(pos))
    }

    /// Take every saved context for rehydration, in original order.
    pub fn take_inflight(&mut self) -> Vec<SavedContext> {
        std::mem::take(&mut self.inflight)
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Queue a message for delivery on the next reconnect. The queue is
    /// bounded; when full, the oldest message makes room.
    pub fn queue_offline(&mut self, publish: Publish) -> QueueResult {
        let mut result = QueueResult::Queued;
        if self.offline.len() >= self.max_offline {
            self.offline.pop_front();
            result = QueueResult::DroppedOldest;
        }
        self.offline.push_back(publish);
        result
    }

    /// Take the offline queue, oldest first.
    pub fn drain_offline(&mut self) -> VecDeque<Publish> {
        std::mem::take(&mut self.offline)
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// Record a granted subscription.
    pub fn add_subscription(&mut self, filter: Arc<str>, qos: QoS) {
        self.subscriptions.insert(filter, qos);
    }

    /// Remove a subscription; returns whether it existed.
    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }
}

/// Thread-safe session store keyed by client id.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    /// Bound applied to new sessions' offline queues
    max_offline: usize,
}

impl SessionStore {
    pub fn new(max_offline: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_offline,
        }
    }

    /// Open a session for a connecting client.
    ///
    /// `clean_session=true` always creates a fresh session (discarding any
    /// previous one). `clean_session=false` resumes an existing session
    /// when present; the second return value is the CONNACK
    /// `session_present` flag.
    pub fn open(&self, client_id: &Arc<str>, clean_session: bool) -> (Arc<RwLock<Session>>, bool) {
        if !clean_session {
            if let Some(existing) = self.sessions.get(client_id) {
                let session = existing.clone();
                drop(existing);
                session.write().clean_session = false;
                return (session, true);
            }
        }

        let session = Arc::new(RwLock::new(Session::new(
            client_id.clone(),
            clean_session,
            self.max_offline,
        )));
        self.sessions.insert(client_id.clone(), session.clone());
        (session, false)
    }

    /// Close a session after its connection terminated. Clean-session
    /// disconnects destroy the session; persistent sessions stay.
    pub fn close(&self, client_id: &str, clean_disconnect: bool) {
        if clean_disconnect {
            self.sessions.remove(client_id);
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

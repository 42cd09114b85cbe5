//! Connection registry
//!
//! Tracks live connections by id and by client id. Rows in the
//! subscription table and sessions refer to connections through
//! [`ConnectionId`]; this registry is the single place that resolves those
//! ids to the channels owned by the connection's tasks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::inflight::QueueCmd;
use crate::transport::ConnectionId;

use super::dispatcher::DispatchCmd;

/// Channel endpoints for one live connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnEntry {
    pub client_id: Arc<str>,
    /// Inbound event loop mailbox
    pub dispatcher: mpsc::UnboundedSender<DispatchCmd>,
    /// State-machine task mailbox (the inflight wait handle)
    pub queue: mpsc::UnboundedSender<QueueCmd>,
}

#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    by_conn: DashMap<ConnectionId, ConnEntry>,
    by_client: DashMap<Arc<str>, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live connection currently bound to `client_id`, if any. A
    /// second CONNECT with the same client id displaces this one.
    pub fn conn_for_client(&self, client_id: &str) -> Option<ConnectionId> {
        self.by_client.get(client_id).map(|c| *c)
    }

    /// Register a connection. The caller displaces any previous holder of
    /// the client id before registering.
    pub fn open(&self, conn_id: ConnectionId, entry: ConnEntry) {
        self.by_client.insert(entry.client_id.clone(), conn_id);
        self.by_conn.insert(conn_id, entry);
    }

    /// Deregister a connection. Idempotent: the first caller gets the
    /// entry and owns teardown, later callers get `None`.
    pub fn close(&self, conn_id: ConnectionId) -> Option<ConnEntry> {
        let (_, entry) = self.by_conn.remove(&conn_id)?;
        // Only unbind the client if it still points at us; a takeover may
        // already have rebound it to the new connection.
        self.by_client
            .remove_if(&entry.client_id, |_, bound| *bound == conn_id);
        Some(entry)
    }

    pub fn get(&self, conn_id: ConnectionId) -> Option<ConnEntry> {
        self.by_conn.get(&conn_id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    /// Snapshot of every live connection id (for shutdown).
    pub fn all_conns(&self) -> Vec<ConnectionId> {
        self.by_conn.iter().map(|e| *e.key()).collect()
    }
}

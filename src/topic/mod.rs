//! Topic matching and the subscription table
//!
//! The table maps topic filters to subscriber rows through a level-split
//! trie ([`trie`]) and is the only structure in the broker shared across
//! connections. All access goes through a reader/writer lock whose
//! critical sections are purely computational: `find_subscribers` copies
//! its results out before any caller does I/O.

mod trie;
pub mod validation;

pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;
use crate::transport::ConnectionId;

use trie::FilterTrie;

/// One subscription row: `(client, filter)` is unique across the table.
#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    /// Subscribing client
    pub client_id: Arc<str>,
    /// Topic filter the row was created for
    pub filter: Arc<str>,
    /// Granted QoS
    pub qos: QoS,
    /// Live connection, if the client is currently connected
    pub connection: Option<ConnectionId>,
    /// Insertion order, for `get_subscription` tie-breaking
    pub(crate) seq: u64,
}

/// Thread-safe subscription table
pub struct SubscriptionTable {
    trie: RwLock<FilterTrie>,
    /// Broker-wide granted QoS ceiling
    max_qos: QoS,
    next_seq: AtomicU64,
}

impl SubscriptionTable {
    pub fn new(max_qos: QoS) -> Self {
        Self {
            trie: RwLock::new(FilterTrie::new()),
            max_qos,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Upsert the row for `(client_id, filter)` and return the granted QoS
    /// (requested QoS capped at the broker maximum), for SUBACK assembly.
    ///
    /// Re-subscribing replaces the granted QoS but keeps the row's original
    /// insertion order.
    pub fn subscribe(
        &self,
        client_id: &Arc<str>,
        filter: &str,
        qos: QoS,
        connection: Option<ConnectionId>,
    ) -> QoS {
        let granted = qos.min(self.max_qos);
        let mut trie = self.trie.write();
        let bucket = trie.bucket_mut(filter);
        if let Some(row) = bucket.iter_mut().find(|r| r.client_id == *client_id) {
            row.qos = granted;
            row.connection = connection;
        } else {
            bucket.push(SubscriptionRow {
                client_id: client_id.clone(),
                filter: Arc::from(filter),
                qos: granted,
                connection,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            });
        }
        granted
    }

    /// Remove the row for `(client_id, filter)`. Idempotent; returns
    /// whether a row existed.
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        let mut trie = self.trie.write();
        trie.remove_where(filter, |r| r.client_id.as_ref() == client_id) > 0
    }

    /// Remove every row for `client_id`.
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.retain_rows(|r| r.client_id.as_ref() != client_id);
    }

    /// Every row whose filter matches `topic`, copied out under the shared
    /// lock. A client with several matching filters appears once per
    /// filter; fan-out deduplicates by explicit projection.
    pub fn find_subscribers(&self, topic: &str) -> SmallVec<[SubscriptionRow; 16]> {
        let trie = self.trie.read();
        let mut out = SmallVec::new();
        trie.matches(topic, |row| out.push(row.clone()));
        out
    }

    /// The best matching row for `client_id` on `topic`: highest granted
    /// QoS, ties broken by the longest non-wildcard filter prefix, then by
    /// insertion order.
    pub fn get_subscription(&self, topic: &str, client_id: &str) -> Option<SubscriptionRow> {
        let trie = self.trie.read();
        let mut best: Option<(SubscriptionRow, usize)> = None;
        trie.matches(topic, |row| {
            if row.client_id.as_ref() != client_id {
                return;
            }
            let prefix = literal_prefix_len(&row.filter);
            let better = match &best {
                None => true,
                Some((b, b_prefix)) => {
                    (row.qos, prefix, std::cmp::Reverse(row.seq))
                        > (b.qos, *b_prefix, std::cmp::Reverse(b.seq))
                }
            };
            if better {
                best = Some((row.clone(), prefix));
            }
        });
        best.map(|(row, _)| row)
    }

    /// Point every row for `client_id` at `connection` (None detaches).
    ///
    /// Called when a persistent session reconnects or its connection goes
    /// away, so rows never outlive the connection they reference.
    pub fn bind_connection(&self, client_id: &str, connection: Option<ConnectionId>) {
        let mut trie = self.trie.write();
        trie.for_each_mut(|row| {
            if row.client_id.as_ref() == client_id {
                row.connection = connection;
            }
        });
    }

    /// Total number of rows.
    pub fn len(&self) -> usize {
        let trie = self.trie.read();
        let mut n = 0;
        trie.for_each(|_| n += 1);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The row for an exact `(client_id, filter)` pair, if present.
    pub fn get_exact(&self, client_id: &str, filter: &str) -> Option<SubscriptionRow> {
        let trie = self.trie.read();
        trie.bucket(filter)?
            .iter()
            .find(|r| r.client_id.as_ref() == client_id)
            .cloned()
    }
}

/// Byte length of the literal level prefix of a filter, before the first
/// wildcard level.
fn literal_prefix_len(filter: &str) -> usize {
    let mut len = 0;
    for level in filter.split('/') {
        if level == "+" || level == "#" {
            break;
        }
        len += level.len() + 1;
    }
    len
}

//! # Peer Records and the Connection Table
//!
//! The connection table is the membership store of a node. It keeps two sets:
//!
//! | Set | Purpose | Bound |
//! |-----|---------|-------|
//! | `connections` | Active peers, usable for `send` | `capacity` |
//! | `known_peers` | Recently active, now disconnected; reconnection candidates | LRU, oldest evicted |
//!
//! Removing a connection demotes its record into `known_peers`; inserting a
//! connection promotes it back out. A record is destroyed only when it is
//! evicted from a full `known_peers`.
//!
//! Connections are kept in insertion order. Admission control scans them in
//! that order, so the order is part of the observable behavior.
//!
//! ## Scoring
//!
//! `average_ping` is an exponential moving average of measured round trips and
//! the score is derived from it: `SCORE_SCALE / (1 + ping / PING_REFERENCE_MS)`.
//! Heartbeat failure overrides the score to zero until the next successful ping.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tracing::trace;

use crate::identity::{Address, Contact, NodeId};

/// Maximum score, awarded to a peer with zero measured ping.
pub const SCORE_SCALE: f64 = 100.0;

/// Ping at which the score halves.
pub const PING_REFERENCE_MS: f64 = 50.0;

/// Weight of a new ping sample in the moving average.
pub const PING_EMA_ALPHA: f64 = 0.3;

/// Default bound on the known-peers table.
pub const DEFAULT_MAX_KNOWN_PEERS: usize = 64;

pub fn score_for_ping(ping_ms: f64) -> f64 {
    SCORE_SCALE / (1.0 + ping_ms.max(0.0) / PING_REFERENCE_MS)
}

#[derive(Clone, Debug, PartialEq)]
pub struct PeerRecord {
    pub id: NodeId,
    pub address: Address,
    pub score: f64,
    /// Milliseconds.
    pub average_ping: f64,
    pub last_updated: Duration,
    pub last_received: Duration,
    pub requested_by_local: bool,
    /// Number of round trips folded into `average_ping`.
    pub ping_samples: u32,
}

impl PeerRecord {
    /// A fresh record with no ping sample yet.
    pub fn new(contact: Contact, now: Duration) -> Self {
        Self {
            id: contact.id,
            address: contact.address,
            score: 0.0,
            average_ping: 0.0,
            last_updated: now,
            last_received: now,
            requested_by_local: false,
            ping_samples: 0,
        }
    }

    /// A record whose score comes from a single ping estimate.
    pub fn with_ping(contact: Contact, ping: Duration, now: Duration) -> Self {
        let mut record = Self::new(contact, now);
        record.record_ping(ping, now);
        record
    }

    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.address)
    }

    /// Fold a round-trip sample into the average and refresh the score.
    pub fn record_ping(&mut self, round_trip: Duration, now: Duration) {
        let sample = round_trip.as_secs_f64() * 1000.0;
        self.average_ping = if self.ping_samples == 0 {
            sample
        } else {
            PING_EMA_ALPHA * sample + (1.0 - PING_EMA_ALPHA) * self.average_ping
        };
        self.ping_samples = self.ping_samples.saturating_add(1);
        self.score = score_for_ping(self.average_ping);
        self.last_updated = now;
    }

    /// Soft penalty applied after a failed heartbeat.
    pub fn penalize(&mut self) {
        self.score = 0.0;
    }
}

pub struct ConnectionTable {
    capacity: usize,
    connections: Vec<PeerRecord>,
    known_peers: LruCache<NodeId, PeerRecord>,
}

impl ConnectionTable {
    pub fn new(capacity: usize, max_known_peers: usize) -> Self {
        let known_cap = NonZeroUsize::new(max_known_peers).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            connections: Vec::with_capacity(capacity),
            known_peers: LruCache::new(known_cap),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.connections.len())
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.connections.iter().any(|r| r.id == *id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        self.connections.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut PeerRecord> {
        self.connections.iter_mut().find(|r| r.id == *id)
    }

    /// Active connections in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.connections.iter()
    }

    pub fn connections(&self) -> &[PeerRecord] {
        &self.connections
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.connections.iter().map(|r| r.id).collect()
    }

    /// Insert or refresh an active connection. An existing entry keeps its
    /// position. Returns `false` only if the table is full and `record` is new.
    pub fn insert(&mut self, record: PeerRecord) -> bool {
        if let Some(existing) = self.get_mut(&record.id) {
            *existing = record;
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.known_peers.pop(&record.id);
        trace!(peer = %record.id, score = record.score, "connection added");
        self.connections.push(record);
        true
    }

    /// Remove an active connection, demoting it into the known peers.
    pub fn remove(&mut self, id: &NodeId) -> Option<PeerRecord> {
        let index = self.connections.iter().position(|r| r.id == *id)?;
        let record = self.connections.remove(index);
        if let Some((evicted, _)) = self.known_peers.push(record.id, record.clone()) {
            if evicted != record.id {
                trace!(peer = %evicted, "known peer evicted");
            }
        }
        trace!(peer = %record.id, "connection demoted to known peers");
        Some(record)
    }

    /// First connection, in insertion order, scoring strictly below `score`
    /// and not in `exclude`.
    pub fn first_weaker_than(&self, score: f64, exclude: &[NodeId]) -> Option<&PeerRecord> {
        self.connections
            .iter()
            .find(|r| r.score < score && !exclude.contains(&r.id))
    }

    /// Mean score of the active connections, 0 when empty.
    pub fn mean_score(&self) -> f64 {
        if self.connections.is_empty() {
            return 0.0;
        }
        self.connections.iter().map(|r| r.score).sum::<f64>() / self.connections.len() as f64
    }

    pub fn known_peer_count(&self) -> usize {
        self.known_peers.len()
    }

    pub fn is_known(&self, id: &NodeId) -> bool {
        self.known_peers.contains(id)
    }

    /// Known peers, most recently demoted first.
    pub fn known_peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.known_peers.iter().map(|(_, r)| r)
    }

    /// Most recently demoted known peer, if any.
    pub fn freshest_known_peer(&self) -> Option<&PeerRecord> {
        self.known_peers.iter().next().map(|(_, r)| r)
    }
}

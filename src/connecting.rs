//! # Connection Negotiation and Admission Control
//!
//! A connection is negotiated bilaterally with one request/response exchange:
//!
//! ```text
//! Requested ──► Accepted   (response.accepted = true)
//!          ├──► Rejected   (response.accepted = false)
//!          └──► TimedOut   (router sweep, absent response)
//! ```
//!
//! The receiving side decides with [`can_accept_connection_with`]:
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | candidate is self | reject |
//! | candidate already connected | reject |
//! | free capacity | accept |
//! | some connection scores below the candidate | accept, evict it |
//! | otherwise | reject |
//!
//! The eviction scan is first-improvement: connections are walked in insertion
//! order and the *first* one scoring strictly below the candidate is chosen,
//! not the worst one. This is deliberate and changes convergence dynamics
//! compared to always evicting the minimum.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tracing::{debug, trace};

use crate::identity::{Contact, NodeId};
use crate::messages::{Packet, Payload};
use crate::node::Node;
use crate::peers::{ConnectionTable, PeerRecord, DEFAULT_MAX_KNOWN_PEERS};

/// Connection table capacity.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// Connection count below which a node actively looks for peers.
pub const DEFAULT_TARGET_CONNECTIONS: usize = 6;

/// Deadline for a connection request.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ConnectingConfig {
    pub max_connections: usize,
    pub target_connections: usize,
    pub request_timeout: Duration,
    pub max_known_peers: usize,
}

impl Default for ConnectingConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            target_connections: DEFAULT_TARGET_CONNECTIONS,
            request_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_known_peers: DEFAULT_MAX_KNOWN_PEERS,
        }
    }
}

/// Why a candidate was not admitted. Recovered locally; never surfaced as a
/// failure of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejected {
    SelfConnection,
    AlreadyConnected,
    NoWeakerPeer,
}

impl fmt::Display for AdmissionRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfConnection => write!(f, "candidate is the local node"),
            Self::AlreadyConnected => write!(f, "candidate is already connected"),
            Self::NoWeakerPeer => write!(f, "table full and no connection scores below the candidate"),
        }
    }
}

impl std::error::Error for AdmissionRejected {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept { evict: Option<NodeId> },
    Reject(AdmissionRejected),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accept { .. })
    }

    pub fn evict(&self) -> Option<NodeId> {
        match self {
            Admission::Accept { evict } => *evict,
            Admission::Reject(_) => None,
        }
    }
}

/// Admission decision for `candidate` against the current table.
pub fn can_accept_connection_with(table: &ConnectionTable, local: NodeId, candidate: &PeerRecord) -> Admission {
    can_accept_excluding(table, local, candidate, &[])
}

/// As [`can_accept_connection_with`], never choosing a victim in `exclude`
/// (peers already marked for eviction by an earlier decision).
pub fn can_accept_excluding(
    table: &ConnectionTable,
    local: NodeId,
    candidate: &PeerRecord,
    exclude: &[NodeId],
) -> Admission {
    if candidate.id == local {
        return Admission::Reject(AdmissionRejected::SelfConnection);
    }
    if table.contains(&candidate.id) {
        return Admission::Reject(AdmissionRejected::AlreadyConnected);
    }
    if !table.is_full() {
        return Admission::Accept { evict: None };
    }
    match table.first_weaker_than(candidate.score, exclude) {
        Some(victim) => Admission::Accept { evict: Some(victim.id) },
        None => Admission::Reject(AdmissionRejected::NoWeakerPeer),
    }
}

/// Terminal state of a negotiation started locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Accepted,
    Rejected,
    TimedOut,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectingStats {
    pub requested: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub inbound_accepted: u64,
    pub inbound_rejected: u64,
    pub evictions: u64,
}

/// Negotiations in the `Requested` state, keyed by candidate.
#[derive(Default)]
pub struct ConnectingState {
    outstanding: HashMap<NodeId, Duration>,
    stats: ConnectingStats,
}

impl ConnectingState {
    pub fn is_outstanding(&self, candidate: &NodeId) -> bool {
        self.outstanding.contains_key(candidate)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn stats(&self) -> ConnectingStats {
        self.stats
    }

    fn begin(&mut self, candidate: NodeId, now: Duration) {
        self.outstanding.insert(candidate, now);
        self.stats.requested += 1;
    }

    fn finish(&mut self, candidate: &NodeId, outcome: NegotiationOutcome) {
        self.outstanding.remove(candidate);
        match outcome {
            NegotiationOutcome::Accepted => self.stats.accepted += 1,
            NegotiationOutcome::Rejected => self.stats.rejected += 1,
            NegotiationOutcome::TimedOut => self.stats.timed_out += 1,
        }
    }
}

impl Node {
    /// Ask `candidate` for a connection. On acceptance the candidate is added
    /// with `requested_by_local` set and `evict_on_success`, if given, is
    /// disconnected. Returns `false` without sending if already connected or
    /// a negotiation with the candidate is in flight.
    pub fn send_connection_request_to(
        &mut self,
        candidate: Contact,
        evict_on_success: Option<NodeId>,
    ) -> anyhow::Result<bool> {
        if candidate.id == self.id
            || self.table.contains(&candidate.id)
            || self.connecting.is_outstanding(&candidate.id)
        {
            return Ok(false);
        }
        let packet = Packet::new(Payload::ConnectionRequest { connection_count: self.table.len() });
        let timeout = self.config.connecting.request_timeout;
        self.connecting.begin(candidate.id, self.ctx.now());
        trace!(node = %self.id, peer = %candidate.id, evict = ?evict_on_success, "connection requested");
        self.router.send_request(
            candidate.address,
            packet,
            Some(timeout),
            Box::new(move |node: &mut Node, response: Option<Packet>| -> anyhow::Result<()> {
                node.on_connection_response(candidate, evict_on_success, response)
            }),
        )?;
        Ok(true)
    }

    fn on_connection_response(
        &mut self,
        candidate: Contact,
        evict_on_success: Option<NodeId>,
        response: Option<Packet>,
    ) -> anyhow::Result<()> {
        let Some(response) = response else {
            self.connecting.finish(&candidate.id, NegotiationOutcome::TimedOut);
            debug!(node = %self.id, peer = %candidate.id, "connection request timed out");
            return Ok(());
        };
        let accepted = matches!(response.payload, Payload::ConnectionResponse { accepted: true, .. });
        if !accepted {
            self.connecting.finish(&candidate.id, NegotiationOutcome::Rejected);
            trace!(node = %self.id, peer = %candidate.id, "connection rejected");
            return Ok(());
        }
        self.connecting.finish(&candidate.id, NegotiationOutcome::Accepted);

        let now = self.ctx.now();
        let mut record = PeerRecord::new(candidate, now);
        record.record_ping(response.round_trip().unwrap_or_default(), now);
        record.requested_by_local = true;

        if let Some(victim) = evict_on_success {
            self.disconnect_from_peer(victim)?;
        }
        if self.table.is_full() && !self.table.contains(&candidate.id) {
            // Lost a race with another admission since the request went out.
            match can_accept_connection_with(&self.table, self.id, &record) {
                Admission::Accept { evict: Some(victim) } => {
                    self.disconnect_from_peer(victim)?;
                }
                _ => {
                    debug!(node = %self.id, peer = %candidate.id, "no room for accepted peer, backing out");
                    self.router.send(candidate.address, Packet::new(Payload::Disconnect))?;
                    return Ok(());
                }
            }
        }

        debug!(node = %self.id, peer = %candidate.id, score = record.score, "connected");
        self.table.insert(record);
        self.on_membership_change()
    }

    /// Drop `peer` (demoting it to the known peers) and tell it so, without
    /// waiting for an acknowledgement. Returns whether it was connected.
    pub fn disconnect_from_peer(&mut self, peer: NodeId) -> anyhow::Result<bool> {
        let Some(record) = self.table.remove(&peer) else {
            return Ok(false);
        };
        self.connecting.stats.evictions += 1;
        debug!(node = %self.id, %peer, "disconnected");
        self.router.send(record.address, Packet::new(Payload::Disconnect))?;
        self.on_membership_change()?;
        Ok(true)
    }

    pub(crate) fn handle_connection_request(&mut self, packet: Packet) -> anyhow::Result<()> {
        let (Some(sender), Some(reply_to)) = (packet.sender(), packet.reply_address()) else {
            return Ok(());
        };
        let now = self.ctx.now();
        let one_way = now.saturating_sub(packet.header.sent_at);
        let candidate = PeerRecord::with_ping(Contact::new(sender, reply_to), one_way * 2, now);

        let decision = can_accept_connection_with(&self.table, self.id, &candidate);
        let accepted = decision.is_accepted();
        if let Admission::Reject(reason) = decision {
            self.connecting.stats.inbound_rejected += 1;
            trace!(node = %self.id, peer = %sender, %reason, "inbound connection rejected");
        }

        let response = Packet::new(Payload::ConnectionResponse {
            accepted,
            connection_count: self.table.len(),
            responder: self.contact(),
        });
        self.router.send_response(&packet, response)?;

        if let Admission::Accept { evict } = decision {
            self.connecting.stats.inbound_accepted += 1;
            if let Some(victim) = evict {
                self.disconnect_from_peer(victim)?;
            }
            debug!(node = %self.id, peer = %sender, score = candidate.score, "inbound connection accepted");
            self.table.insert(candidate);
            self.on_membership_change()?;
        }
        Ok(())
    }

    /// A response that arrived after its request timed out. The remote may
    /// have admitted us, so undo that rather than leave it a stale entry.
    pub(crate) fn handle_late_connection_response(&mut self, packet: Packet) -> anyhow::Result<()> {
        if let Payload::ConnectionResponse { accepted: true, responder, .. } = packet.payload {
            if !self.table.contains(&responder.id) {
                trace!(node = %self.id, peer = %responder.id, "late acceptance, sending disconnect");
                self.router.send(responder.address, Packet::new(Payload::Disconnect))?;
            }
        }
        Ok(())
    }

    pub(crate) fn handle_disconnect(&mut self, packet: Packet) -> anyhow::Result<()> {
        let Some(sender) = packet.sender() else {
            return Ok(());
        };
        if self.table.remove(&sender).is_some() {
            debug!(node = %self.id, peer = %sender, "peer disconnected");
            self.on_membership_change()?;
        }
        Ok(())
    }
}

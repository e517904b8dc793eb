//! # Liveness and Aggregate Health
//!
//! Two mechanisms keep the connection table honest:
//!
//! | Mechanism | Applies to | On failure |
//! |-----------|-----------|------------|
//! | Heartbeat (`Ping`) | connections this node initiated | first miss zeroes the score; a miss at zero disconnects |
//! | Passive lease | connections the peer initiated | dropped after `passive_lease` without any packet from the peer |
//!
//! The mean connection score is re-evaluated on every membership change. A
//! drop of at least `regression_threshold` below the best mean seen so far
//! triggers a discovery advertisement; any other value ratchets the best mean
//! upward.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::identity::NodeId;
use crate::messages::{Packet, Payload};
use crate::node::Node;
use crate::peers::PeerRecord;

/// Time between heartbeat rounds.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Deadline for a single heartbeat.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);

/// Relative drop in mean score treated as a regression.
pub const DEFAULT_REGRESSION_THRESHOLD: f64 = 0.10;

/// Silence after which a passive connection is dropped.
pub const DEFAULT_PASSIVE_LEASE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct HealthConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub regression_threshold: f64,
    pub passive_lease: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            regression_threshold: DEFAULT_REGRESSION_THRESHOLD,
            passive_lease: DEFAULT_PASSIVE_LEASE,
        }
    }
}

/// What a failed heartbeat did to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Penalized,
    Disconnect,
}

pub fn heartbeat_failed(record: &mut PeerRecord) -> HeartbeatVerdict {
    if record.score == 0.0 {
        HeartbeatVerdict::Disconnect
    } else {
        record.penalize();
        HeartbeatVerdict::Penalized
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub heartbeats_sent: u64,
    pub heartbeats_missed: u64,
    pub leases_expired: u64,
    pub regressions: u64,
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    best_mean: f64,
    next_heartbeat: Duration,
    in_flight: HashSet<NodeId>,
    stats: HealthStats,
}

impl HealthMonitor {
    pub fn best_mean(&self) -> f64 {
        self.best_mean
    }

    pub fn stats(&self) -> HealthStats {
        self.stats
    }

    /// Fold in a freshly computed mean. Returns `true` on regression, in
    /// which case the best mean is reset to `mean`.
    pub fn observe_mean(&mut self, mean: f64, threshold: f64) -> bool {
        if self.best_mean > 0.0 && mean <= self.best_mean * (1.0 - threshold) {
            self.best_mean = mean;
            self.stats.regressions += 1;
            return true;
        }
        if mean > self.best_mean {
            self.best_mean = mean;
        }
        false
    }

    /// True at most once per `interval`.
    pub fn heartbeat_due(&mut self, now: Duration, interval: Duration) -> bool {
        if now < self.next_heartbeat {
            return false;
        }
        self.next_heartbeat = now + interval;
        true
    }
}

impl Node {
    /// Re-evaluate aggregate health after the connection set changed.
    pub(crate) fn on_membership_change(&mut self) -> anyhow::Result<()> {
        let mean = self.table.mean_score();
        let threshold = self.config.health.regression_threshold;
        if self.health.observe_mean(mean, threshold) {
            info!(node = %self.id, mean, connections = self.table.len(), "health regression, rediscovering");
            self.try_broadcast_discovery_request()?;
        }
        Ok(())
    }

    pub(crate) fn run_heartbeats(&mut self) -> anyhow::Result<()> {
        let now = self.ctx.now();
        if !self.health.heartbeat_due(now, self.config.health.heartbeat_interval) {
            return Ok(());
        }
        let due: Vec<PeerRecord> = self
            .table
            .iter()
            .filter(|r| r.requested_by_local && !self.health.in_flight.contains(&r.id))
            .cloned()
            .collect();
        let timeout = self.config.health.heartbeat_timeout;
        for peer in due {
            let id = peer.id;
            self.health.in_flight.insert(id);
            self.health.stats.heartbeats_sent += 1;
            self.router.send_request(
                peer.address,
                Packet::new(Payload::Ping),
                Some(timeout),
                Box::new(move |node: &mut Node, response: Option<Packet>| -> anyhow::Result<()> {
                    node.on_heartbeat(id, response)
                }),
            )?;
        }
        Ok(())
    }

    fn on_heartbeat(&mut self, peer: NodeId, response: Option<Packet>) -> anyhow::Result<()> {
        self.health.in_flight.remove(&peer);
        let now = self.ctx.now();
        let Some(record) = self.table.get_mut(&peer) else {
            return Ok(());
        };
        match response {
            Some(pong) => {
                record.record_ping(pong.round_trip().unwrap_or_default(), now);
                record.last_received = now;
                trace!(node = %self.id, %peer, score = record.score, "heartbeat ok");
                Ok(())
            }
            None => {
                self.health.stats.heartbeats_missed += 1;
                match heartbeat_failed(record) {
                    HeartbeatVerdict::Penalized => {
                        debug!(node = %self.id, %peer, "heartbeat missed, score zeroed");
                        self.on_membership_change()
                    }
                    HeartbeatVerdict::Disconnect => {
                        debug!(node = %self.id, %peer, "heartbeat missed at zero score, dropping");
                        self.disconnect_from_peer(peer).map(|_| ())
                    }
                }
            }
        }
    }

    pub(crate) fn expire_passive_leases(&mut self) -> anyhow::Result<()> {
        let now = self.ctx.now();
        let lease = self.config.health.passive_lease;
        let expired: Vec<NodeId> = self
            .table
            .iter()
            .filter(|r| !r.requested_by_local && now.saturating_sub(r.last_received) >= lease)
            .map(|r| r.id)
            .collect();
        for peer in expired {
            debug!(node = %self.id, %peer, "passive lease expired");
            self.health.stats.leases_expired += 1;
            self.disconnect_from_peer(peer)?;
        }
        Ok(())
    }

    pub(crate) fn handle_ping(&mut self, packet: Packet) -> anyhow::Result<()> {
        let pong = Packet::new(Payload::Pong { connection_count: self.table.len() });
        self.router.send_response(&packet, pong)?;
        Ok(())
    }

    pub(crate) fn handle_late_pong(&mut self, packet: Packet) -> anyhow::Result<()> {
        trace!(node = %self.id, sender = ?packet.sender(), "late pong dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Address, Contact};
    use crate::messages::PacketType;
    use crate::node::harness::{quiet_config, Pair};

    #[test]
    fn best_mean_ratchets_upward() {
        let mut monitor = HealthMonitor::default();
        assert!(!monitor.observe_mean(50.0, 0.1));
        assert!(!monitor.observe_mean(60.0, 0.1));
        assert_eq!(monitor.best_mean(), 60.0);
        // A small dip neither regresses nor lowers the best.
        assert!(!monitor.observe_mean(56.0, 0.1));
        assert_eq!(monitor.best_mean(), 60.0);
    }

    #[test]
    fn ten_percent_drop_is_a_regression() {
        let mut monitor = HealthMonitor::default();
        monitor.observe_mean(80.0, 0.1);
        assert!(monitor.observe_mean(72.0, 0.1));
        assert_eq!(monitor.best_mean(), 72.0);
        assert!(!monitor.observe_mean(70.0, 0.1));
        assert_eq!(monitor.stats().regressions, 1);
    }

    #[test]
    fn empty_start_never_regresses() {
        let mut monitor = HealthMonitor::default();
        assert!(!monitor.observe_mean(0.0, 0.1));
        assert_eq!(monitor.best_mean(), 0.0);
    }

    #[test]
    fn failed_heartbeat_penalizes_then_disconnects() {
        let contact = Contact::new(NodeId(1), Address(1));
        let mut record = PeerRecord::with_ping(contact, Duration::from_millis(20), Duration::ZERO);
        assert!(record.score > 0.0);
        assert_eq!(heartbeat_failed(&mut record), HeartbeatVerdict::Penalized);
        assert_eq!(record.score, 0.0);
        assert_eq!(heartbeat_failed(&mut record), HeartbeatVerdict::Disconnect);
    }

    #[test]
    fn heartbeat_schedule_respects_interval() {
        let mut monitor = HealthMonitor::default();
        let interval = Duration::from_secs(2);
        assert!(monitor.heartbeat_due(Duration::ZERO, interval));
        assert!(!monitor.heartbeat_due(Duration::from_secs(1), interval));
        assert!(monitor.heartbeat_due(Duration::from_secs(2), interval));
    }

    #[test]
    fn heartbeats_go_only_to_locally_requested_peers() {
        let mut pair = Pair::new(3, quiet_config());
        pair.connect(0, 1);
        pair.connect(2, 0);
        assert_eq!(pair.nodes[0].table.len(), 2);

        pair.nodes[0].tick().unwrap();
        let pings: Vec<Address> = pair
            .outbox
            .take()
            .into_iter()
            .filter(|(_, p)| p.packet_type() == PacketType::Ping)
            .map(|(to, _)| to)
            .collect();
        assert_eq!(pings, vec![Address(101)]);
        assert_eq!(pair.nodes[0].health.stats().heartbeats_sent, 1);
    }

    #[test]
    fn missed_heartbeats_zero_the_score_then_drop_the_peer() {
        let mut pair = Pair::new(2, quiet_config());
        pair.connect(0, 1);
        let timeout = pair.nodes[0].config.health.heartbeat_timeout;
        let interval = pair.nodes[0].config.health.heartbeat_interval;

        pair.nodes[0].tick().unwrap();
        pair.outbox.take();
        pair.ctx.advance(timeout);
        pair.nodes[0].tick().unwrap();

        let record = pair.nodes[0].table.get(&NodeId(1)).cloned().unwrap();
        assert_eq!(record.score, 0.0);
        assert_eq!(pair.nodes[0].health.stats().heartbeats_missed, 1);

        // The score collapse is a regression, which advertises the node.
        assert_eq!(pair.nodes[0].health.stats().regressions, 1);
        assert_eq!(pair.nodes[0].discovery.advertisements, 1);
        let sent = pair.outbox.take();
        assert!(sent
            .iter()
            .any(|(to, p)| *to == Address(101) && p.packet_type() == PacketType::DiscoveryBroadcast));

        pair.ctx.advance(interval - timeout);
        pair.nodes[0].tick().unwrap();
        assert!(pair.outbox.take().iter().any(|(_, p)| p.packet_type() == PacketType::Ping));
        pair.ctx.advance(timeout);
        pair.nodes[0].tick().unwrap();

        assert!(!pair.nodes[0].table.contains(&NodeId(1)));
        assert!(pair.nodes[0].table.is_known(&NodeId(1)));
        assert_eq!(pair.nodes[0].health.stats().heartbeats_missed, 2);
        assert!(pair
            .outbox
            .take()
            .iter()
            .any(|(to, p)| *to == Address(101) && p.packet_type() == PacketType::Disconnect));
    }
}

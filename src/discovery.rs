//! # Discovery and Peer Sampling
//!
//! Nodes find each other by epidemic advertisement. A node short of peers
//! broadcasts a `DiscoveryBroadcast` naming itself; every receiver relays it
//! and, with a probability that falls as the network grows, answers by
//! requesting a connection to the origin.
//!
//! ## Gate
//!
//! [`DiscoveryGate`] throttles how often a node may advertise:
//!
//! | Timer | Fires when |
//! |-------|-----------|
//! | cooldown | `cooldown` has elapsed since the last advertisement |
//! | under-target override | the node has been below its target connection count for `under_target_override` without a break |
//!
//! Either timer opens the gate. Firing resets the cooldown and restarts the
//! under-target window.
//!
//! ## Bootstrap
//!
//! A joining node asks a seed for candidates (`SubscriptionRequest`), pings
//! every candidate concurrently, and once every ping has resolved
//! ranks them by score: free slots are filled first, then any remaining
//! candidate may swap out a connection it beats. One discovery broadcast
//! closes the round.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};

use crate::connecting::{can_accept_connection_with, Admission};
use crate::identity::{Address, Contact, NodeId};
use crate::messages::{Packet, Payload};
use crate::node::Node;
use crate::peers::PeerRecord;

/// Minimum time between two advertisements.
pub const DEFAULT_DISCOVERY_COOLDOWN: Duration = Duration::from_secs(15);

/// Continuous time under target after which the cooldown is bypassed.
pub const DEFAULT_UNDER_TARGET_OVERRIDE: Duration = Duration::from_secs(5);

/// Candidates returned in one subscription response.
pub const DEFAULT_SUBSCRIPTION_CANDIDATES: usize = 8;

/// Deadline for a bootstrap ping.
pub const DEFAULT_BOOTSTRAP_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Network sizes mapped onto the acceptance range; larger sizes clamp.
pub const ACCEPTANCE_SIZE_RANGE: (f64, f64) = (0.0, 100_000.0);

/// Acceptance range in percent.
pub const ACCEPTANCE_PERCENT_RANGE: (f64, f64) = (60.0, 99.999);

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub cooldown: Duration,
    pub under_target_override: Duration,
    pub subscription_candidates: usize,
    pub ping_timeout: Duration,
    /// Fanout used for advertisements instead of the broadcaster's default.
    pub fanout_override: Option<usize>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_DISCOVERY_COOLDOWN,
            under_target_override: DEFAULT_UNDER_TARGET_OVERRIDE,
            subscription_candidates: DEFAULT_SUBSCRIPTION_CANDIDATES,
            ping_timeout: DEFAULT_BOOTSTRAP_PING_TIMEOUT,
            fanout_override: None,
        }
    }
}

/// Linear map of `value` from `[from_low, from_high]` onto `[to_low, to_high]`.
pub fn map_range(value: f64, from_low: f64, from_high: f64, to_low: f64, to_high: f64) -> f64 {
    to_low + (value - from_low) * (to_high - to_low) / (from_high - from_low)
}

/// Probability, in `[0.6, 0.99999]`, that a node answers a discovery
/// advertisement with a connection attempt.
///
/// Linear in the estimated network size over `ACCEPTANCE_SIZE_RANGE`, so the
/// probability *rises* with size (0.80 at 50k nodes). This runs against the
/// intent that larger networks should favor relaying over connecting; the
/// mapping is kept as written and the relay happens regardless of the roll.
pub fn acceptance_probability(estimated_network_size: usize) -> f64 {
    let (size_low, size_high) = ACCEPTANCE_SIZE_RANGE;
    let (pct_low, pct_high) = ACCEPTANCE_PERCENT_RANGE;
    let size = (estimated_network_size as f64).clamp(size_low, size_high);
    map_range(size, size_low, size_high, pct_low, pct_high) / 100.0
}

#[derive(Clone, Debug, Default)]
pub struct DiscoveryGate {
    cooldown_until: Option<Duration>,
    under_target_since: Option<Duration>,
}

impl DiscoveryGate {
    /// Track whether the node is currently below target. A single
    /// observation at or above target breaks the window.
    pub fn observe(&mut self, now: Duration, under_target: bool) {
        match (under_target, self.under_target_since) {
            (true, None) => self.under_target_since = Some(now),
            (false, Some(_)) => self.under_target_since = None,
            _ => {}
        }
    }

    pub fn is_open(&self, now: Duration, config: &DiscoveryConfig) -> bool {
        let cooled = self.cooldown_until.map_or(true, |until| now >= until);
        let overdue = self
            .under_target_since
            .map_or(false, |since| now.saturating_sub(since) >= config.under_target_override);
        cooled || overdue
    }

    pub fn fired(&mut self, now: Duration, config: &DiscoveryConfig) {
        self.cooldown_until = Some(now + config.cooldown);
        if self.under_target_since.is_some() {
            self.under_target_since = Some(now);
        }
    }
}

/// Bootstrap pings in flight. Outcomes are collected until all resolved.
#[derive(Debug)]
pub struct BootstrapRound {
    pub id: u64,
    pub expected: usize,
    pub resolved: usize,
    pub responsive: Vec<PeerRecord>,
}

impl BootstrapRound {
    pub fn new(id: u64, expected: usize) -> Self {
        Self { id, expected, resolved: 0, responsive: Vec::with_capacity(expected) }
    }

    /// Record one ping outcome. Returns true once every ping has resolved.
    pub fn record(&mut self, outcome: Option<PeerRecord>) -> bool {
        self.resolved += 1;
        if let Some(record) = outcome {
            self.responsive.push(record);
        }
        self.resolved >= self.expected
    }
}

/// Discovery state owned by a node.
#[derive(Debug, Default)]
pub struct DiscoveryState {
    pub gate: DiscoveryGate,
    pub bootstrap: Option<BootstrapRound>,
    next_round: u64,
    pub advertisements: u64,
    pub answered: u64,
    pub declined: u64,
}

impl Node {
    /// Advertise this node to the overlay if the gate allows it. Returns
    /// `false` when suppressed.
    pub fn try_broadcast_discovery_request(&mut self) -> anyhow::Result<bool> {
        let now = self.ctx.now();
        let under_target = self.table.len() < self.config.connecting.target_connections;
        self.discovery.gate.observe(now, under_target);
        if !self.discovery.gate.is_open(now, &self.config.discovery) {
            trace!(node = %self.id, "discovery suppressed by gate");
            return Ok(false);
        }
        self.discovery.gate.fired(now, &self.config.discovery);
        self.discovery.advertisements += 1;

        let packet = Packet::new(Payload::DiscoveryBroadcast {
            origin: self.contact(),
            originated_at: now,
            connection_count: self.table.len(),
        });
        let broadcast_id = self.broadcaster.send_broadcast(
            &mut self.router,
            &self.table,
            &mut self.rng,
            packet,
            self.config.discovery.fanout_override,
        )?;
        debug!(node = %self.id, broadcast_id, connections = self.table.len(), "discovery advertised");

        if under_target {
            if let Some(known) = self.table.freshest_known_peer().map(PeerRecord::contact) {
                trace!(node = %self.id, peer = %known.id, "reconnecting to known peer");
                self.send_connection_request_to(known, None)?;
            }
        }
        Ok(true)
    }

    pub(crate) fn handle_discovery_broadcast(&mut self, packet: Packet) -> anyhow::Result<()> {
        let Payload::DiscoveryBroadcast { origin, originated_at, .. } = packet.payload else {
            return Ok(());
        };
        if origin.id == self.id {
            return Ok(());
        }

        if !self.table.contains(&origin.id) {
            let probability = acceptance_probability(self.ctx.estimated_network_size());
            if self.rng.gen::<f64>() < probability {
                self.discovery.answered += 1;
                self.answer_advertisement(origin, originated_at)?;
            } else {
                self.discovery.declined += 1;
                trace!(node = %self.id, peer = %origin.id, "advertisement declined");
            }
        }

        self.broadcaster
            .relay_broadcast(&mut self.router, &self.table, &mut self.rng, &packet)?;
        Ok(())
    }

    fn answer_advertisement(&mut self, origin: Contact, originated_at: Duration) -> anyhow::Result<()> {
        if !self.table.is_full() {
            self.send_connection_request_to(origin, None)?;
            return Ok(());
        }
        let now = self.ctx.now();
        let age = now.saturating_sub(originated_at);
        let candidate = PeerRecord::with_ping(origin, age * 2, now);
        match can_accept_connection_with(&self.table, self.id, &candidate) {
            Admission::Accept { evict } => {
                self.send_connection_request_to(origin, evict)?;
            }
            Admission::Reject(reason) => {
                trace!(node = %self.id, peer = %origin.id, %reason, "no room for advertised peer");
            }
        }
        Ok(())
    }

    /// Join the overlay through `seed`.
    pub fn bootstrap(&mut self, seed: Address) -> anyhow::Result<()> {
        let timeout = self.config.discovery.ping_timeout;
        debug!(node = %self.id, %seed, "bootstrapping");
        self.router.send_request(
            seed,
            Packet::new(Payload::SubscriptionRequest),
            Some(timeout),
            Box::new(move |node: &mut Node, response: Option<Packet>| -> anyhow::Result<()> {
                node.on_subscription_resolved(seed, response)
            }),
        )?;
        Ok(())
    }

    fn on_subscription_resolved(&mut self, seed: Address, response: Option<Packet>) -> anyhow::Result<()> {
        let Some(response) = response else {
            debug!(node = %self.id, %seed, "bootstrap seed did not answer");
            return Ok(());
        };
        let responder = response.sender();
        let mut candidates = match response.payload {
            Payload::SubscriptionResponse { candidates } => candidates,
            _ => Vec::new(),
        };
        if let Some(responder) = responder {
            candidates.push(Contact::new(responder, seed));
        }
        self.on_receive_subscription_response(candidates)
    }

    /// Ping every candidate, then admit the best ones.
    pub fn on_receive_subscription_response(&mut self, candidates: Vec<Contact>) -> anyhow::Result<()> {
        let mut unique: Vec<Contact> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.id != self.id && !unique.iter().any(|c| c.id == candidate.id) {
                unique.push(candidate);
            }
        }
        if unique.is_empty() {
            self.try_broadcast_discovery_request()?;
            return Ok(());
        }

        self.discovery.next_round += 1;
        let round_id = self.discovery.next_round;
        if self.discovery.bootstrap.is_some() {
            debug!(node = %self.id, round_id, "superseding unfinished bootstrap round");
        }
        self.discovery.bootstrap = Some(BootstrapRound::new(round_id, unique.len()));
        debug!(node = %self.id, round_id, candidates = unique.len(), "pinging bootstrap candidates");

        let timeout = self.config.discovery.ping_timeout;
        for contact in unique {
            self.router.send_request(
                contact.address,
                Packet::new(Payload::Ping),
                Some(timeout),
                Box::new(move |node: &mut Node, response: Option<Packet>| -> anyhow::Result<()> {
                    node.on_bootstrap_ping(round_id, contact, response)
                }),
            )?;
        }
        Ok(())
    }

    fn on_bootstrap_ping(&mut self, round_id: u64, contact: Contact, response: Option<Packet>) -> anyhow::Result<()> {
        let now = self.ctx.now();
        let outcome = response.map(|r| PeerRecord::with_ping(contact, r.round_trip().unwrap_or_default(), now));
        let complete = match self.discovery.bootstrap.as_mut() {
            Some(round) if round.id == round_id => round.record(outcome),
            _ => return Ok(()),
        };
        if !complete {
            return Ok(());
        }
        match self.discovery.bootstrap.take() {
            Some(round) => self.complete_bootstrap(round.responsive),
            None => Ok(()),
        }
    }

    fn complete_bootstrap(&mut self, mut pinged: Vec<PeerRecord>) -> anyhow::Result<()> {
        pinged.sort_by(|a, b| a.score.total_cmp(&b.score));
        debug!(node = %self.id, responsive = pinged.len(), "bootstrap pings complete");

        let mut free = self.table.free_slots().saturating_sub(self.connecting.outstanding());
        let mut marked: Vec<NodeId> = Vec::new();
        for candidate in &pinged {
            if candidate.id == self.id
                || self.table.contains(&candidate.id)
                || self.connecting.is_outstanding(&candidate.id)
            {
                continue;
            }
            if free > 0 {
                if self.send_connection_request_to(candidate.contact(), None)? {
                    free -= 1;
                }
                continue;
            }
            // Free slots may all be reserved by requests in flight, so the
            // swap scan ignores spare capacity.
            let victim = self.table.first_weaker_than(candidate.score, &marked).map(|r| r.id);
            if let Some(victim) = victim {
                marked.push(victim);
                self.send_connection_request_to(candidate.contact(), Some(victim))?;
            }
        }
        self.try_broadcast_discovery_request()?;
        Ok(())
    }

    pub(crate) fn handle_subscription_request(&mut self, packet: Packet) -> anyhow::Result<()> {
        let requester = packet.sender();
        let limit = self.config.discovery.subscription_candidates;
        let candidates: Vec<Contact> = self
            .table
            .iter()
            .chain(self.table.known_peers())
            .map(PeerRecord::contact)
            .filter(|c| Some(c.id) != requester)
            .take(limit)
            .collect();
        trace!(node = %self.id, requester = ?requester, count = candidates.len(), "answering subscription");
        self.router
            .send_response(&packet, Packet::new(Payload::SubscriptionResponse { candidates }))?;
        Ok(())
    }

    pub(crate) fn handle_late_subscription_response(&mut self, packet: Packet) -> anyhow::Result<()> {
        trace!(node = %self.id, sender = ?packet.sender(), "late subscription response dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::messages::{BroadcastInfo, PacketType};
    use crate::node::harness::{quiet_config, Pair};

    /// A discovery advertisement for `origin`, relayed to `to` by `sender`.
    fn advertisement(pair: &Pair, to: usize, sender: usize, origin: usize) -> Packet {
        let origin = pair.nodes[origin].contact();
        let payload = Payload::DiscoveryBroadcast { origin, originated_at: pair.ctx.now(), connection_count: 0 };
        let mut packet = pair.inbound(to, NodeId(sender as u64), payload);
        packet.broadcast = Some(BroadcastInfo { broadcaster_id: origin.id, broadcast_id: 9_000 });
        packet
    }

    #[test]
    fn map_range_is_linear() {
        assert_eq!(map_range(0.0, 0.0, 10.0, 5.0, 15.0), 5.0);
        assert_eq!(map_range(10.0, 0.0, 10.0, 5.0, 15.0), 15.0);
        assert_eq!(map_range(2.5, 0.0, 10.0, 0.0, 100.0), 25.0);
    }

    #[test]
    fn acceptance_is_bounded_and_monotonic() {
        assert!((acceptance_probability(0) - 0.60).abs() < 1e-12);
        assert!((acceptance_probability(100_000) - 0.99999).abs() < 1e-12);
        assert_eq!(acceptance_probability(5_000_000), acceptance_probability(100_000));
        assert!(acceptance_probability(10) < acceptance_probability(50_000));
    }

    #[test]
    fn acceptance_at_fifty_thousand_matches_sampling() {
        let p = acceptance_probability(50_000);
        assert!((p - 0.799995).abs() < 1e-9);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let trials = 10_000;
        let accepted = (0..trials).filter(|_| rng.gen::<f64>() < p).count();
        let rate = accepted as f64 / trials as f64;
        assert!((0.78..=0.82).contains(&rate), "observed rate {rate}");
    }

    #[test]
    fn gate_opens_initially_then_cools_down() {
        let config = DiscoveryConfig::default();
        let mut gate = DiscoveryGate::default();
        assert!(gate.is_open(Duration::ZERO, &config));
        gate.fired(Duration::ZERO, &config);
        assert!(!gate.is_open(Duration::from_secs(1), &config));
        assert!(gate.is_open(config.cooldown, &config));
    }

    #[test]
    fn gate_override_requires_continuous_under_target_time() {
        let config = DiscoveryConfig {
            cooldown: Duration::from_secs(60),
            under_target_override: Duration::from_secs(5),
            ..Default::default()
        };
        let mut gate = DiscoveryGate::default();
        gate.observe(Duration::ZERO, true);
        gate.fired(Duration::ZERO, &config);

        gate.observe(Duration::from_secs(3), true);
        assert!(!gate.is_open(Duration::from_secs(3), &config));

        // Briefly reaching target restarts the window.
        gate.observe(Duration::from_secs(4), false);
        gate.observe(Duration::from_secs(4), true);
        assert!(!gate.is_open(Duration::from_secs(8), &config));
        assert!(gate.is_open(Duration::from_secs(9), &config));

        gate.fired(Duration::from_secs(9), &config);
        assert!(!gate.is_open(Duration::from_secs(13), &config));
        assert!(gate.is_open(Duration::from_secs(14), &config));
    }

    #[test]
    fn bootstrap_round_completes_after_every_outcome() {
        let mut round = BootstrapRound::new(1, 3);
        let contact = Contact::new(NodeId(2), Address(2));
        assert!(!round.record(None));
        assert!(!round.record(Some(PeerRecord::new(contact, Duration::ZERO))));
        assert!(round.record(None));
        assert_eq!(round.responsive.len(), 1);
    }

    #[test]
    fn own_advertisement_is_neither_answered_nor_relayed() {
        let mut pair = Pair::new(3, quiet_config());
        pair.connect(0, 1);
        pair.connect(0, 2);

        let packet = advertisement(&pair, 0, 1, 0);
        pair.nodes[0].receive(packet).unwrap();
        assert!(pair.outbox.take().is_empty());
        assert_eq!(pair.nodes[0].discovery.answered, 0);
        assert_eq!(pair.nodes[0].discovery.declined, 0);
    }

    #[test]
    fn advertisement_from_connected_origin_is_only_relayed() {
        let mut pair = Pair::new(3, quiet_config());
        pair.connect(0, 1);
        pair.connect(0, 2);

        let packet = advertisement(&pair, 0, 1, 1);
        pair.nodes[0].receive(packet).unwrap();
        let sent = pair.outbox.take();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|(_, p)| p.packet_type() == PacketType::DiscoveryBroadcast));
        assert_eq!(pair.nodes[0].discovery.answered, 0);
        assert_eq!(pair.nodes[0].connecting.outstanding(), 0);
    }

    #[test]
    fn full_table_answers_advertisement_with_a_swap() {
        let mut config = quiet_config();
        config.connecting.max_connections = 1;
        let mut pair = Pair::new(3, config);
        pair.connect(0, 2);
        pair.nodes[0].table.get_mut(&NodeId(2)).unwrap().score = 10.0;
        pair.ctx.set_estimated_network_size(100_000);

        let packet = advertisement(&pair, 0, 2, 1);
        pair.nodes[0].receive(packet).unwrap();
        assert_eq!(pair.nodes[0].discovery.answered, 1);
        assert!(pair.nodes[0].connecting.is_outstanding(&NodeId(1)));

        // Only the request to the advertiser and its answer travel.
        for (to, packet) in pair.outbox.take() {
            if packet.packet_type() == PacketType::ConnectionRequest && to == Address(101) {
                pair.deliver(to, packet);
            }
        }
        for (to, packet) in pair.outbox.take() {
            if to == Address(100) {
                pair.deliver(to, packet);
            }
        }
        let table = &pair.nodes[0].table;
        assert!(table.contains(&NodeId(1)));
        assert!(!table.contains(&NodeId(2)));
        assert!(table.is_known(&NodeId(2)));
    }

    #[test]
    fn bootstrap_swaps_candidates_beyond_reserved_slots() {
        let mut config = quiet_config();
        config.connecting.max_connections = 2;
        let mut pair = Pair::new(9, config);
        let now = pair.ctx.now();
        let mut weak = PeerRecord::new(pair.nodes[5].contact(), now);
        weak.score = 10.0;
        pair.nodes[0].table.insert(weak);

        let fast = PeerRecord::with_ping(pair.nodes[7].contact(), Duration::from_millis(10), now);
        let slow = PeerRecord::with_ping(pair.nodes[8].contact(), Duration::from_millis(200), now);
        assert!(slow.score > 10.0 && fast.score > slow.score);
        pair.nodes[0].complete_bootstrap(vec![fast, slow]).unwrap();

        // The slow candidate takes the free slot; the fast one must still
        // be asked, with the weak peer marked for eviction.
        assert_eq!(pair.nodes[0].connecting.outstanding(), 2);
        assert!(pair.nodes[0].connecting.is_outstanding(&NodeId(7)));
        assert!(pair.nodes[0].connecting.is_outstanding(&NodeId(8)));

        for (to, packet) in pair.outbox.take() {
            if packet.packet_type() == PacketType::ConnectionRequest {
                pair.deliver(to, packet);
            }
        }
        for (to, packet) in pair.outbox.take() {
            if to == Address(100) {
                pair.deliver(to, packet);
            }
        }
        let table = &pair.nodes[0].table;
        assert!(table.contains(&NodeId(7)));
        assert!(table.contains(&NodeId(8)));
        assert!(!table.contains(&NodeId(5)));
        assert!(table.is_known(&NodeId(5)));
    }

    #[test]
    fn subscription_response_pings_then_fills_free_slots() {
        let mut pair = Pair::new(3, quiet_config());
        let candidates = vec![
            pair.nodes[1].contact(),
            pair.nodes[2].contact(),
            pair.nodes[1].contact(),
            pair.nodes[0].contact(),
        ];
        pair.nodes[0].on_receive_subscription_response(candidates).unwrap();
        assert!(pair.nodes[0].is_bootstrapping());
        let pings = pair.outbox.take();
        assert_eq!(pings.len(), 2);
        assert!(pings.iter().all(|(_, p)| p.packet_type() == PacketType::Ping));

        for (to, packet) in pings {
            pair.deliver(to, packet);
        }
        pair.flush();
        assert!(!pair.nodes[0].is_bootstrapping());
        let table = &pair.nodes[0].table;
        assert_eq!(table.len(), 2);
        assert!(table.contains(&NodeId(1)) && table.contains(&NodeId(2)));
        assert!(table.iter().all(|r| r.requested_by_local));
    }
}

//! # Fanout Broadcast
//!
//! This module implements epidemic dissemination on top of the packet router.
//! A broadcast is sent to `fanout` randomly chosen connections; every receiver
//! that accepts it relays it to `fanout` of its own connections.
//!
//! ## Message Flow
//!
//! 1. **Send**: stamp `broadcaster_id` + fresh `broadcast_id`, send a clone to
//!    each sampled target
//! 2. **Admit**: on receipt, bump the relay count for `broadcast_id`; drop once
//!    it exceeds `max_relay_cycles`, else run the reception middleware
//! 3. **Handle**: the registered handler runs, and usually relays
//! 4. **Relay**: resend to sampled targets, avoiding the immediate sender and
//!    the original broadcaster
//!
//! ## Bounded De-duplication
//!
//! Relay counts live in an LRU map of `dedup_capacity` entries. When full, the
//! least recently seen broadcast is forgotten. A forgotten broadcast that
//! comes back counts from zero again; `max_relay_cycles` still bounds how often
//! it can be handled while it is remembered.
//!
//! ## Target Sampling
//!
//! Targets are drawn uniformly *with replacement*, so one peer may receive the
//! same broadcast twice in a round. Relays retry draws that hit an excluded
//! peer, but give up after `2 × fanout` draws and accept whatever comes next.

use std::num::NonZeroUsize;

use lru::LruCache;
use rand::Rng;
use tracing::{debug, trace};

use crate::identity::{Address, NodeId};
use crate::messages::{BroadcastInfo, Packet, PacketType};
use crate::peers::{ConnectionTable, PeerRecord};
use crate::rpc::{ConfigurationError, Handler, HandlerKind, PacketRouter};

/// Peers a broadcast is forwarded to per round.
pub const DEFAULT_FANOUT: usize = 3;

/// Times a node handles and relays the same broadcast before dropping it.
pub const DEFAULT_MAX_RELAY_CYCLES: u32 = 2;

/// Broadcast ids remembered for de-duplication.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    pub fanout: usize,
    pub max_relay_cycles: u32,
    pub dedup_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
            max_relay_cycles: DEFAULT_MAX_RELAY_CYCLES,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

/// Broadcast-reception middleware. Returning `false` vetoes handling.
pub type BroadcastMiddleware = Box<dyn Fn(&Packet) -> bool + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub originated: u64,
    pub relayed: u64,
    pub admitted: u64,
    pub cycle_drops: u64,
    pub vetoed: u64,
}

pub struct Broadcaster {
    config: BroadcastConfig,
    /// broadcast_id -> relay count.
    dedup: LruCache<u64, u32>,
    middleware: Vec<BroadcastMiddleware>,
    stats: BroadcastStats,
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        let cap = NonZeroUsize::new(config.dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            dedup: LruCache::new(cap),
            middleware: Vec::new(),
            stats: BroadcastStats::default(),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }

    /// Register `handler` behind the de-duplication guard and the reception
    /// middleware chain.
    pub fn register_handler_with_middleware<C>(
        &self,
        router: &mut PacketRouter<C>,
        packet_type: PacketType,
        handler: Handler<C>,
    ) -> Result<u16, ConfigurationError> {
        if !packet_type.kinds().broadcastable {
            return Err(ConfigurationError::NotBroadcastable(packet_type));
        }
        router.register(packet_type, handler, HandlerKind::BroadcastGuarded)
    }

    pub fn add_reception_middleware(&mut self, middleware: BroadcastMiddleware) {
        self.middleware.push(middleware);
    }

    /// `fanout_override` if positive, else `min(fanout, connections)`.
    pub fn current_fanout(&self, connections: usize, fanout_override: Option<usize>) -> usize {
        match fanout_override {
            Some(n) if n > 0 => n,
            _ => self.config.fanout.min(connections),
        }
    }

    /// Relay count recorded for a broadcast, if still remembered.
    pub fn relay_count(&self, broadcast_id: u64) -> Option<u32> {
        self.dedup.peek(&broadcast_id).copied()
    }

    /// Originate a broadcast. Returns its `broadcast_id`.
    pub fn send_broadcast<C, R: Rng>(
        &mut self,
        router: &mut PacketRouter<C>,
        table: &ConnectionTable,
        rng: &mut R,
        mut packet: Packet,
        fanout_override: Option<usize>,
    ) -> Result<u64, ConfigurationError> {
        let packet_type = packet.packet_type();
        if !packet_type.kinds().broadcastable {
            return Err(ConfigurationError::NotBroadcastable(packet_type));
        }
        let info = BroadcastInfo {
            broadcaster_id: router.local_id(),
            broadcast_id: router.context().next_unique_id(),
        };
        packet.broadcast = Some(info);

        let fanout = self.current_fanout(table.len(), fanout_override);
        let targets = sample_targets(table.connections(), fanout, rng);
        debug!(
            node = %router.local_id(),
            broadcast_id = info.broadcast_id,
            ?packet_type,
            targets = targets.len(),
            "originating broadcast"
        );
        for to in targets {
            router.send(to, packet.clone())?;
        }
        self.stats.originated += 1;
        Ok(info.broadcast_id)
    }

    /// Forward a received broadcast. Returns the number of copies sent.
    pub fn relay_broadcast<C, R: Rng>(
        &mut self,
        router: &mut PacketRouter<C>,
        table: &ConnectionTable,
        rng: &mut R,
        packet: &Packet,
    ) -> Result<usize, ConfigurationError> {
        let Some(info) = packet.broadcast else {
            return Err(ConfigurationError::NotBroadcastable(packet.packet_type()));
        };
        let mut exclude = vec![info.broadcaster_id];
        if let Some(sender) = packet.sender() {
            exclude.push(sender);
        }

        let fanout = self.current_fanout(table.len(), None);
        let targets = sample_relay_targets(table.connections(), fanout, &exclude, rng);
        trace!(
            node = %router.local_id(),
            broadcast_id = info.broadcast_id,
            targets = targets.len(),
            "relaying broadcast"
        );
        for &to in &targets {
            router.send(to, packet.clone())?;
        }
        self.stats.relayed += 1;
        Ok(targets.len())
    }

    /// De-duplication guard for inbound broadcastable packets. `false` means
    /// the packet must be neither handled nor relayed.
    pub fn admit(&mut self, packet: &Packet) -> bool {
        if let Some(info) = packet.broadcast {
            let count = self.dedup.get_or_insert_mut(info.broadcast_id, || 0);
            *count = count.saturating_add(1);
            if *count > self.config.max_relay_cycles {
                self.stats.cycle_drops += 1;
                trace!(broadcast_id = info.broadcast_id, count = *count, "relay cycles exceeded, dropping");
                return false;
            }
        }
        if !self.middleware.iter().all(|m| m(packet)) {
            self.stats.vetoed += 1;
            return false;
        }
        self.stats.admitted += 1;
        true
    }
}

/// Uniform sampling with replacement.
fn sample_targets<R: Rng>(connections: &[PeerRecord], count: usize, rng: &mut R) -> Vec<Address> {
    if connections.is_empty() {
        return Vec::new();
    }
    (0..count)
        .map(|_| connections[rng.gen_range(0..connections.len())].address)
        .collect()
}

/// Sampling with replacement that tries to skip `exclude`, giving up after
/// `2 × count` draws in total.
fn sample_relay_targets<R: Rng>(
    connections: &[PeerRecord],
    count: usize,
    exclude: &[NodeId],
    rng: &mut R,
) -> Vec<Address> {
    if connections.is_empty() {
        return Vec::new();
    }
    let budget = count * 2;
    let mut draws = 0;
    let mut targets = Vec::with_capacity(count);
    for _ in 0..count {
        let peer = loop {
            let candidate = &connections[rng.gen_range(0..connections.len())];
            draws += 1;
            if !exclude.contains(&candidate.id) || draws >= budget {
                break candidate;
            }
        };
        targets.push(peer.address);
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::identity::{Contact, SimContext};
    use crate::messages::Payload;
    use crate::protocols::Transport;
    use crate::rpc::RouterConfig;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<(Address, Packet)>>);

    impl Transport for Outbox {
        fn send(&self, to: Address, packet: Packet) {
            self.0.lock().unwrap().push((to, packet));
        }
    }

    struct Owner;

    fn on_app(_: &mut Owner, _: Packet) -> anyhow::Result<()> {
        Ok(())
    }

    fn setup(peers: &[u64]) -> (PacketRouter<Owner>, ConnectionTable, Arc<Outbox>) {
        let ctx = Arc::new(SimContext::new(1));
        let outbox = Arc::new(Outbox::default());
        let mut router = PacketRouter::new(NodeId(0), Address(0), ctx, outbox.clone() as Arc<dyn Transport>, RouterConfig::default());
        router.register_handler(PacketType::Application, on_app).unwrap();
        let mut table = ConnectionTable::new(peers.len().max(1), 8);
        for &id in peers {
            table.insert(PeerRecord::new(Contact::new(NodeId(id), Address(id)), Duration::ZERO));
        }
        (router, table, outbox)
    }

    fn app() -> Packet {
        Packet::new(Payload::Application { channel: "t".into(), data: vec![7] })
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = BroadcastConfig::default();
        assert!(config.fanout > 0);
        assert!(config.max_relay_cycles >= 1);
        assert!(config.dedup_capacity >= 16);
    }

    #[test]
    fn fanout_honors_override_and_connection_count() {
        let b = Broadcaster::new(BroadcastConfig { fanout: 3, ..Default::default() });
        assert_eq!(b.current_fanout(10, None), 3);
        assert_eq!(b.current_fanout(2, None), 2);
        assert_eq!(b.current_fanout(2, Some(5)), 5);
        assert_eq!(b.current_fanout(10, Some(0)), 3);
    }

    #[test]
    fn send_broadcast_clones_to_fanout_targets() {
        let (mut router, table, outbox) = setup(&[1, 2, 3, 4, 5]);
        let mut b = Broadcaster::new(BroadcastConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let id = b.send_broadcast(&mut router, &table, &mut rng, app(), None).unwrap();
        let sent = outbox.0.lock().unwrap().clone();
        assert_eq!(sent.len(), DEFAULT_FANOUT);
        let mut unique_ids: Vec<u64> = sent.iter().map(|(_, p)| p.header.unique_id).collect();
        unique_ids.dedup();
        assert_eq!(unique_ids.len(), DEFAULT_FANOUT);
        for (_, packet) in &sent {
            let info = packet.broadcast.unwrap();
            assert_eq!(info.broadcast_id, id);
            assert_eq!(info.broadcaster_id, NodeId(0));
        }
    }

    #[test]
    fn send_broadcast_without_connections_sends_nothing() {
        let (mut router, _, outbox) = setup(&[]);
        let table = ConnectionTable::new(4, 4);
        let mut b = Broadcaster::new(BroadcastConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        b.send_broadcast(&mut router, &table, &mut rng, app(), None).unwrap();
        assert!(outbox.0.lock().unwrap().is_empty());
    }

    #[test]
    fn non_broadcastable_type_is_rejected() {
        let (mut router, table, _) = setup(&[1]);
        let mut b = Broadcaster::new(BroadcastConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert_eq!(
            b.send_broadcast(&mut router, &table, &mut rng, Packet::new(Payload::Ping), None),
            Err(ConfigurationError::NotBroadcastable(PacketType::Ping))
        );
        assert_eq!(
            b.register_handler_with_middleware(&mut router, PacketType::Ping, on_app),
            Err(ConfigurationError::NotBroadcastable(PacketType::Ping))
        );
    }

    #[test]
    fn relay_avoids_sender_and_origin_when_possible() {
        let peers: Vec<PeerRecord> = (1..=3)
            .map(|id| PeerRecord::new(Contact::new(NodeId(id), Address(id)), Duration::ZERO))
            .collect();
        let exclude = [NodeId(1), NodeId(2)];
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut to_excluded = 0;
        for _ in 0..200 {
            let targets = sample_relay_targets(&peers, 1, &exclude, &mut rng);
            assert_eq!(targets.len(), 1);
            if targets[0] != Address(3) {
                to_excluded += 1;
            }
        }
        // Each relay allows two draws; both miss with probability 4/9.
        assert!(to_excluded < 140, "excluded peers chosen {to_excluded} times");
    }

    #[test]
    fn relay_terminates_when_only_excluded_peers_remain() {
        let (mut router, table, outbox) = setup(&[1, 2]);
        let mut b = Broadcaster::new(BroadcastConfig { fanout: 2, ..Default::default() });
        let mut rng = ChaCha8Rng::seed_from_u64(5);

        let mut packet = app();
        packet.header.sender_id = Some(NodeId(1));
        packet.broadcast = Some(BroadcastInfo { broadcaster_id: NodeId(2), broadcast_id: 99 });

        let sent = b.relay_broadcast(&mut router, &table, &mut rng, &packet).unwrap();
        assert_eq!(sent, 2);
        for (_, relayed) in outbox.0.lock().unwrap().iter() {
            assert_eq!(relayed.broadcast.map(|i| i.broadcast_id), Some(99));
            assert_eq!(relayed.header.sender_id, Some(NodeId(0)));
        }
    }

    #[test]
    fn admit_drops_after_max_relay_cycles() {
        let mut b = Broadcaster::new(BroadcastConfig { max_relay_cycles: 2, ..Default::default() });
        let mut packet = app();
        packet.broadcast = Some(BroadcastInfo { broadcaster_id: NodeId(9), broadcast_id: 1 });

        assert!(b.admit(&packet));
        assert!(b.admit(&packet));
        assert!(!b.admit(&packet));
        assert!(!b.admit(&packet));
        assert_eq!(b.stats().cycle_drops, 2);
        assert_eq!(b.relay_count(1), Some(4));
    }

    #[test]
    fn dedup_map_is_bounded() {
        let mut b = Broadcaster::new(BroadcastConfig { dedup_capacity: 2, max_relay_cycles: 1, ..Default::default() });
        for id in 1..=3 {
            let mut packet = app();
            packet.broadcast = Some(BroadcastInfo { broadcaster_id: NodeId(9), broadcast_id: id });
            assert!(b.admit(&packet));
        }
        assert_eq!(b.relay_count(1), None);
        assert_eq!(b.relay_count(3), Some(1));
    }

    #[test]
    fn reception_middleware_vetoes() {
        let mut b = Broadcaster::new(BroadcastConfig::default());
        b.add_reception_middleware(Box::new(|p: &Packet| p.broadcast.map(|i| i.broadcaster_id) != Some(NodeId(0))));
        let mut own = app();
        own.broadcast = Some(BroadcastInfo { broadcaster_id: NodeId(0), broadcast_id: 5 });
        let mut other = app();
        other.broadcast = Some(BroadcastInfo { broadcaster_id: NodeId(4), broadcast_id: 6 });

        assert!(!b.admit(&own));
        assert!(b.admit(&other));
        assert_eq!(b.stats().vetoed, 1);
    }
}

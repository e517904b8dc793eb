//! # Overlay Node
//!
//! A [`Node`] wires the components of one simulated peer together and is the
//! only thing a driver talks to:
//!
//! ```text
//!            receive(packet)                      tick()
//!                 │                                 │
//!                 ▼                                 ▼
//!   PacketRouter::route ─► Route          sweep expired requests
//!        │                   │            heartbeats, passive leases
//!        │        Handle ────┤            discovery when under target
//!        │        Resolve ───┤
//!        │        Drop ──────┘
//!        ▼
//!   Broadcaster::admit (broadcastable types only)
//!        ▼
//!   handler(&mut Node, packet)
//! ```
//!
//! ## Dispatch Table
//!
//! The set of packet types is closed, so every node registers the same
//! handlers in the same order ([`PacketType::ALL`]) at construction. Type ids
//! therefore agree across nodes without any negotiation.
//!
//! ## Ownership
//!
//! A node is single-writer: every mutation happens inside `receive`, `tick`
//! or one of the public operations, all taking `&mut self`. Drivers either
//! step nodes in lock-step (`sim`) or give each node its own task (`actor`).
//!
//! ## Quick Start
//!
//! ```ignore
//! let ctx = Arc::new(SimContext::new(7));
//! let network = Arc::new(SimNetwork::new(NetworkConfig::default(), ctx.clone()));
//! let mut node = Node::new(contact, ctx, network, NodeConfig::default())?;
//! node.bootstrap(seed_address)?;
//! loop {
//!     for packet in inbound { node.receive(packet)?; }
//!     node.tick()?;
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

use crate::broadcast::{BroadcastConfig, BroadcastMiddleware, BroadcastStats, Broadcaster};
use crate::connecting::{ConnectingConfig, ConnectingState, ConnectingStats};
use crate::discovery::{DiscoveryConfig, DiscoveryState};
use crate::health::{HealthConfig, HealthMonitor, HealthStats};
use crate::identity::{Address, Contact, NodeId, SimContext};
use crate::messages::{Packet, PacketType, Payload};
use crate::peers::{ConnectionTable, PeerRecord};
use crate::protocols::Transport;
use crate::rpc::{
    ConfigurationError, Handler, HandlerKind, PacketRouter, ReceiveMiddleware, ResponseCallback, Route,
    RouterConfig, RouterStats,
};

/// Application messages buffered before the oldest is dropped.
pub const DEFAULT_MAX_INBOX: usize = 1024;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub router: RouterConfig,
    pub broadcast: BroadcastConfig,
    pub connecting: ConnectingConfig,
    pub discovery: DiscoveryConfig,
    pub health: HealthConfig,
    pub max_inbox: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            broadcast: BroadcastConfig::default(),
            connecting: ConnectingConfig::default(),
            discovery: DiscoveryConfig::default(),
            health: HealthConfig::default(),
            max_inbox: DEFAULT_MAX_INBOX,
        }
    }
}

/// Opaque handle for answering an application request.
#[derive(Clone, Debug)]
pub struct ReplyToken(Packet);

/// An application message delivered to this node.
#[derive(Clone, Debug)]
pub struct DeliveredMessage {
    pub from: Option<NodeId>,
    pub channel: String,
    pub data: Vec<u8>,
    /// Set when the message arrived as part of a broadcast.
    pub broadcast_id: Option<u64>,
    /// Set when the sender can be answered with [`Node::reply`].
    pub reply: Option<ReplyToken>,
    pub received_at: Duration,
}

/// Point-in-time view of a node, for telemetry.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub address: Address,
    pub connections: Vec<NodeId>,
    pub known_peers: usize,
    pub mean_score: f64,
    pub pending_requests: usize,
    pub router: RouterStats,
    pub broadcast: BroadcastStats,
    pub connecting: ConnectingStats,
    pub health: HealthStats,
}

pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) address: Address,
    pub(crate) ctx: Arc<SimContext>,
    pub(crate) config: NodeConfig,
    pub(crate) router: PacketRouter<Node>,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) table: ConnectionTable,
    pub(crate) connecting: ConnectingState,
    pub(crate) discovery: DiscoveryState,
    pub(crate) health: HealthMonitor,
    pub(crate) rng: ChaCha8Rng,
    inbox: VecDeque<DeliveredMessage>,
}

impl Node {
    pub fn new(
        contact: Contact,
        ctx: Arc<SimContext>,
        transport: Arc<dyn Transport>,
        config: NodeConfig,
    ) -> Result<Self, ConfigurationError> {
        let router = PacketRouter::new(contact.id, contact.address, ctx.clone(), transport, config.router.clone());
        let mut node = Self {
            id: contact.id,
            address: contact.address,
            rng: ctx.rng_for(contact.id),
            ctx,
            router,
            broadcaster: Broadcaster::new(config.broadcast.clone()),
            table: ConnectionTable::new(config.connecting.max_connections, config.connecting.max_known_peers),
            connecting: ConnectingState::default(),
            discovery: DiscoveryState::default(),
            health: HealthMonitor::default(),
            inbox: VecDeque::new(),
            config,
        };
        node.register_dispatch_table()?;
        Ok(node)
    }

    fn register_dispatch_table(&mut self) -> Result<(), ConfigurationError> {
        for packet_type in PacketType::ALL {
            let handler: Handler<Node> = match packet_type {
                PacketType::ConnectionRequest => Node::handle_connection_request,
                PacketType::ConnectionResponse => Node::handle_late_connection_response,
                PacketType::Disconnect => Node::handle_disconnect,
                PacketType::DiscoveryBroadcast => Node::handle_discovery_broadcast,
                PacketType::Ping => Node::handle_ping,
                PacketType::Pong => Node::handle_late_pong,
                PacketType::SubscriptionRequest => Node::handle_subscription_request,
                PacketType::SubscriptionResponse => Node::handle_late_subscription_response,
                PacketType::Application => Node::handle_application,
                PacketType::ApplicationReply => Node::handle_late_application_reply,
            };
            if packet_type.kinds().broadcastable {
                self.broadcaster
                    .register_handler_with_middleware(&mut self.router, packet_type, handler)?;
            } else {
                self.router.register_handler(packet_type, handler)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.address)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    /// Active connections, for candidate selection by upstream protocols.
    pub fn connections(&self) -> &[PeerRecord] {
        self.table.connections()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.stats()
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.discovery.bootstrap.is_some()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id,
            address: self.address,
            connections: self.table.ids(),
            known_peers: self.table.known_peer_count(),
            mean_score: self.table.mean_score(),
            pending_requests: self.router.pending_count(),
            router: self.router.stats(),
            broadcast: self.broadcaster.stats(),
            connecting: self.connecting.stats(),
            health: self.health.stats(),
        }
    }

    // ========================================================================
    // Driver Entry Points
    // ========================================================================

    /// Deliver one inbound packet. Errors are configuration errors and fatal.
    pub fn receive(&mut self, packet: Packet) -> anyhow::Result<()> {
        let sender = packet.sender();
        match self.router.route(packet)? {
            Route::Handle { handler, kind, packet } => {
                self.refresh_lease(sender);
                if kind == HandlerKind::BroadcastGuarded && !self.broadcaster.admit(&packet) {
                    return Ok(());
                }
                handler(self, packet)
            }
            Route::Resolve { callback, packet } => {
                self.refresh_lease(sender);
                callback(self, Some(packet))
            }
            Route::Drop(reason) => {
                trace!(node = %self.id, ?reason, "inbound packet dropped");
                Ok(())
            }
        }
    }

    /// Only packets that made it past the receive middleware count as a sign
    /// of life.
    fn refresh_lease(&mut self, sender: Option<NodeId>) {
        let now = self.ctx.now();
        if let Some(record) = sender.and_then(|id| self.table.get_mut(&id)) {
            record.last_received = now;
        }
    }

    /// Advance timers: expire requests, heartbeat, lease and discovery.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        for callback in self.router.sweep_expired() {
            callback(self, None)?;
        }
        self.run_heartbeats()?;
        self.expire_passive_leases()?;

        let now = self.ctx.now();
        let under_target = self.table.len() < self.config.connecting.target_connections;
        self.discovery.gate.observe(now, under_target);
        if under_target && !self.is_bootstrapping() {
            self.try_broadcast_discovery_request()?;
        }
        Ok(())
    }

    // ========================================================================
    // Upstream Protocol Surface
    // ========================================================================

    pub fn add_receive_middleware(&mut self, middleware: ReceiveMiddleware) {
        self.router.add_receive_middleware(middleware);
    }

    pub fn add_broadcast_middleware(&mut self, middleware: BroadcastMiddleware) {
        self.broadcaster.add_reception_middleware(middleware);
    }

    pub fn send(&mut self, to: Address, packet: Packet) -> anyhow::Result<u64> {
        Ok(self.router.send(to, packet)?)
    }

    pub fn send_request(
        &mut self,
        to: Address,
        packet: Packet,
        timeout: Option<Duration>,
        callback: ResponseCallback<Node>,
    ) -> anyhow::Result<u64> {
        Ok(self.router.send_request(to, packet, timeout, callback)?)
    }

    pub fn send_broadcast(&mut self, packet: Packet, fanout_override: Option<usize>) -> anyhow::Result<u64> {
        Ok(self
            .broadcaster
            .send_broadcast(&mut self.router, &self.table, &mut self.rng, packet, fanout_override)?)
    }

    pub fn relay_broadcast(&mut self, packet: &Packet) -> anyhow::Result<usize> {
        Ok(self
            .broadcaster
            .relay_broadcast(&mut self.router, &self.table, &mut self.rng, packet)?)
    }

    /// Broadcast an application message to the overlay. Returns its broadcast id.
    pub fn publish(&mut self, channel: &str, data: Vec<u8>) -> anyhow::Result<u64> {
        let packet = Packet::new(Payload::Application { channel: channel.to_string(), data });
        let broadcast_id = self.send_broadcast(packet, None)?;
        debug!(node = %self.id, channel, broadcast_id, "published");
        Ok(broadcast_id)
    }

    /// Send an application message to one node, without expecting a reply.
    pub fn send_application(&mut self, to: Address, channel: &str, data: Vec<u8>) -> anyhow::Result<u64> {
        self.send(to, Packet::new(Payload::Application { channel: channel.to_string(), data }))
    }

    /// Send an application message and resolve `callback` with the reply, or
    /// with `None` once `timeout` elapses.
    pub fn send_application_request(
        &mut self,
        to: Address,
        channel: &str,
        data: Vec<u8>,
        timeout: Option<Duration>,
        callback: ResponseCallback<Node>,
    ) -> anyhow::Result<u64> {
        let packet = Packet::new(Payload::Application { channel: channel.to_string(), data });
        self.send_request(to, packet, timeout, callback)
    }

    /// Answer a delivered application message.
    pub fn reply(&mut self, token: &ReplyToken, data: Vec<u8>) -> anyhow::Result<u64> {
        Ok(self
            .router
            .send_response(&token.0, Packet::new(Payload::ApplicationReply { data }))?)
    }

    pub fn drain_messages(&mut self) -> Vec<DeliveredMessage> {
        self.inbox.drain(..).collect()
    }

    // ========================================================================
    // Application Handlers
    // ========================================================================

    fn handle_application(&mut self, packet: Packet) -> anyhow::Result<()> {
        let broadcast = packet.broadcast;
        if broadcast.map_or(false, |info| info.broadcaster_id == self.id) {
            return Ok(());
        }
        if broadcast.is_some() {
            self.relay_broadcast(&packet)?;
        }

        let from = packet.sender();
        let reply = match (broadcast, packet.reply_address()) {
            (None, Some(_)) => Some(ReplyToken(packet.clone())),
            _ => None,
        };
        let Payload::Application { channel, data } = packet.payload else {
            return Ok(());
        };
        if self.inbox.len() >= self.config.max_inbox.max(1) {
            self.inbox.pop_front();
            debug!(node = %self.id, "inbox full, dropping oldest message");
        }
        self.inbox.push_back(DeliveredMessage {
            from,
            channel,
            data,
            broadcast_id: broadcast.map(|info| info.broadcast_id),
            reply,
            received_at: self.ctx.now(),
        });
        Ok(())
    }

    fn handle_late_application_reply(&mut self, packet: Packet) -> anyhow::Result<()> {
        trace!(node = %self.id, sender = ?packet.sender(), "late application reply dropped");
        Ok(())
    }
}

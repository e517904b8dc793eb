//! # Lock-step Simulation Driver
//!
//! Runs a population of [`Node`]s over a shared [`SimNetwork`] in discrete
//! steps. Each step:
//!
//! 1. advances the simulated clock by `step`
//! 2. delivers every packet whose latency has elapsed
//! 3. ticks every online node in address order
//!
//! Everything is driven from one thread and every random choice comes from a
//! seeded RNG, so a run is reproducible from its seed.
//!
//! ## Churn
//!
//! Nodes may join ([`Simulation::add_node`]), leave for good
//! ([`Simulation::remove_node`]) or go to sleep ([`Simulation::set_offline`]).
//! A sleeping node is frozen: it neither receives nor ticks, and its peers
//! only notice through missed heartbeats and expired leases.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IteratorRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::identity::{Address, Contact, NodeId, SimContext};
use crate::node::{Node, NodeConfig, NodeSnapshot};
use crate::protocols::Transport;
use crate::transport::{NetworkConfig, SimNetwork, TrafficStats};

/// Simulated time per step.
pub const DEFAULT_STEP: Duration = Duration::from_millis(10);

/// Addresses are offset from ids so the two are never confused.
pub const ADDRESS_BASE: u64 = 0x1000;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub node_count: usize,
    pub seed: u64,
    pub step: Duration,
    pub network: NetworkConfig,
    pub node: NodeConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_count: 32,
            seed: 0,
            step: DEFAULT_STEP,
            network: NetworkConfig::default(),
            node: NodeConfig::default(),
        }
    }
}

/// Aggregate view of the simulation.
#[derive(Clone, Debug, Default)]
pub struct Telemetry {
    pub now: Duration,
    pub nodes: usize,
    pub online: usize,
    pub isolated: usize,
    pub min_connections: usize,
    pub max_connections: usize,
    pub mean_connections: f64,
    pub mean_score: f64,
    pub pending_requests: usize,
    pub traffic: TrafficStats,
}

pub struct Simulation {
    config: SimConfig,
    ctx: Arc<SimContext>,
    network: Arc<SimNetwork>,
    nodes: BTreeMap<Address, Node>,
    offline: HashSet<Address>,
    rng: ChaCha8Rng,
    next_id: u64,
    steps: u64,
}

impl Simulation {
    /// Create `node_count` nodes. Every node after the first bootstraps
    /// through a random earlier one.
    pub fn new(config: SimConfig) -> anyhow::Result<Self> {
        let ctx = Arc::new(SimContext::new(config.seed));
        let network = Arc::new(SimNetwork::new(config.network.clone(), ctx.clone()));
        let mut sim = Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            ctx,
            network,
            nodes: BTreeMap::new(),
            offline: HashSet::new(),
            next_id: 0,
            steps: 0,
        };
        for _ in 0..sim.config.node_count {
            sim.add_node()?;
        }
        info!(nodes = sim.nodes.len(), seed = sim.config.seed, "simulation created");
        Ok(sim)
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    pub fn now(&self) -> Duration {
        self.ctx.now()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, address: Address) -> Option<&Node> {
        self.nodes.get(&address)
    }

    pub fn node_mut(&mut self, address: Address) -> Option<&mut Node> {
        self.nodes.get_mut(&address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.nodes.keys().copied().collect()
    }

    pub fn is_offline(&self, address: Address) -> bool {
        self.offline.contains(&address)
    }

    /// Spawn a node and bootstrap it through a random online node, if any.
    pub fn add_node(&mut self) -> anyhow::Result<Address> {
        let id = NodeId(self.next_id);
        let address = Address(ADDRESS_BASE + self.next_id);
        self.next_id += 1;

        let seed = self
            .nodes
            .keys()
            .filter(|a| !self.offline.contains(*a))
            .copied()
            .choose(&mut self.rng);

        let transport = self.network.clone() as Arc<dyn Transport>;
        let mut node = Node::new(Contact::new(id, address), self.ctx.clone(), transport, self.config.node.clone())?;
        if let Some(seed) = seed {
            node.bootstrap(seed)?;
        }
        self.nodes.insert(address, node);
        self.ctx.set_estimated_network_size(self.nodes.len());
        debug!(node = %id, %address, seed = ?seed, "node joined");
        Ok(address)
    }

    /// Remove a node for good. Its peers find out through timeouts.
    pub fn remove_node(&mut self, address: Address) -> Option<Node> {
        let node = self.nodes.remove(&address)?;
        self.offline.remove(&address);
        self.network.set_offline(address, false);
        self.ctx.set_estimated_network_size(self.nodes.len());
        debug!(node = %node.id(), %address, "node left");
        Some(node)
    }

    pub fn set_offline(&mut self, address: Address, offline: bool) {
        if offline {
            self.offline.insert(address);
        } else {
            self.offline.remove(&address);
        }
        self.network.set_offline(address, offline);
    }

    pub fn step(&mut self) -> anyhow::Result<()> {
        self.ctx.advance(self.config.step);
        self.steps += 1;

        for (to, packet) in self.network.drain_due(self.ctx.now()) {
            match self.nodes.get_mut(&to) {
                Some(node) => node.receive(packet)?,
                None => self.network.record_unroutable(),
            }
        }
        for (address, node) in self.nodes.iter_mut() {
            if !self.offline.contains(address) {
                node.tick()?;
            }
        }
        Ok(())
    }

    pub fn run(&mut self, steps: u64) -> anyhow::Result<()> {
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    /// Step until at least `duration` of simulated time has passed.
    pub fn run_for(&mut self, duration: Duration) -> anyhow::Result<()> {
        let until = self.ctx.now() + duration;
        while self.ctx.now() < until {
            self.step()?;
        }
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.values().map(Node::snapshot).collect()
    }

    pub fn telemetry(&self) -> Telemetry {
        let online: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|(a, _)| !self.offline.contains(*a))
            .map(|(_, n)| n)
            .collect();
        let counts: Vec<usize> = online.iter().map(|n| n.table().len()).collect();
        let connected = counts.iter().filter(|&&c| c > 0).count();
        let scored: Vec<f64> = online
            .iter()
            .filter(|n| !n.table().is_empty())
            .map(|n| n.table().mean_score())
            .collect();

        Telemetry {
            now: self.ctx.now(),
            nodes: self.nodes.len(),
            online: online.len(),
            isolated: online.len() - connected,
            min_connections: counts.iter().copied().min().unwrap_or(0),
            max_connections: counts.iter().copied().max().unwrap_or(0),
            mean_connections: mean(counts.iter().map(|&c| c as f64)),
            mean_score: mean(scored.into_iter()),
            pending_requests: self.nodes.values().map(|n| n.snapshot().pending_requests).sum(),
            traffic: self.network.stats(),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

//! # Node Identities and Simulation Context
//!
//! Every simulated node has a [`NodeId`] (unique within the simulation) and an
//! [`Address`] (the routable destination handed to the transport). The two are
//! kept distinct: a node may be re-addressed without changing identity.
//!
//! ## Simulation Context
//!
//! All state that would otherwise be global lives in a [`SimContext`] that is
//! passed by construction to every component:
//!
//! | Field | Purpose |
//! |-------|---------|
//! | clock | Simulated time, advanced by the driver once per step |
//! | unique ids | Monotonic generator for packet and broadcast ids |
//! | network size | Estimated global population, read by discovery |
//! | seed | Root seed for per-node deterministic RNGs |
//!
//! The context only holds atomics, so it can be shared as `Arc<SimContext>`
//! between the lock-step driver and tokio actors alike.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Golden-ratio multiplier used to spread node ids across the seed space.
const SEED_SPREAD: u64 = 0x9E37_79B9_7F4A_7C15;

/// Identity of a simulated node. Unique within one [`SimContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{:04x}", self.0)
    }
}

/// Routable destination of a node, as understood by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:04x}", self.0)
    }
}

/// A peer as advertised by another node: identity plus where to reach it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub address: Address,
}

impl Contact {
    pub fn new(id: NodeId, address: Address) -> Self {
        Self { id, address }
    }
}

/// Shared simulation context. See the module docs.
#[derive(Debug)]
pub struct SimContext {
    seed: u64,
    clock_ms: AtomicU64,
    next_id: AtomicU64,
    estimated_network_size: AtomicUsize,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            clock_ms: AtomicU64::new(0),
            // 0 is never handed out so it can't collide with a default header.
            next_id: AtomicU64::new(1),
            estimated_network_size: AtomicUsize::new(0),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Current simulated time since the start of the run.
    pub fn now(&self) -> Duration {
        Duration::from_millis(self.clock_ms.load(Ordering::Acquire))
    }

    /// Advance the simulated clock. Only drivers call this.
    pub fn advance(&self, step: Duration) {
        let millis = u64::try_from(step.as_millis()).unwrap_or(u64::MAX);
        self.clock_ms.fetch_add(millis, Ordering::AcqRel);
    }

    /// Fresh id, monotonically increasing and unique across all nodes.
    pub fn next_unique_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn estimated_network_size(&self) -> usize {
        self.estimated_network_size.load(Ordering::Relaxed)
    }

    pub fn set_estimated_network_size(&self, size: usize) {
        self.estimated_network_size.store(size, Ordering::Relaxed);
    }

    /// Deterministic RNG for one node, derived from the root seed.
    pub fn rng_for(&self, node: NodeId) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed ^ node.0.wrapping_mul(SEED_SPREAD))
    }
}

impl Default for SimContext {
    fn default() -> Self {
        Self::new(0)
    }
}

//! # Simulated Transports
//!
//! Two implementations of [`Transport`], one per driver:
//!
//! | Transport | Driver | Delivery |
//! |-----------|--------|----------|
//! | [`SimNetwork`] | lock-step `Simulation` | queued with sampled latency, drained once per step |
//! | [`ChannelTransport`] | tokio actors | bincode frames over bounded `mpsc` channels |
//!
//! Both drop silently: packet loss is sampled per send, offline (sleeping)
//! nodes and unknown addresses swallow whatever is sent to them. Neither ever
//! duplicates a packet.
//!
//! ## Latency Model
//!
//! `latency = base_latency ± jitter_fraction × base_latency`, sampled
//! uniformly per packet and floored at 1ms. Packets due at the same instant
//! are delivered in send order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::identity::{Address, SimContext};
use crate::messages::{encode_packet, Packet};
use crate::protocols::Transport;

/// One-way latency before jitter.
pub const DEFAULT_BASE_LATENCY: Duration = Duration::from_millis(40);

/// Jitter as a fraction of the base latency.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.25;

/// Frames buffered per node in actor mode before new ones are dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub base_latency: Duration,
    pub jitter_fraction: f64,
    /// Probability in `[0, 1]` that any single packet is lost.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_latency: DEFAULT_BASE_LATENCY,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            packet_loss_rate: 0.0,
        }
    }
}

impl NetworkConfig {
    fn sample_latency<R: Rng>(&self, rng: &mut R) -> Duration {
        let base = self.base_latency.as_secs_f64();
        let spread = base * self.jitter_fraction.clamp(0.0, 1.0);
        let jitter = if spread > 0.0 { rng.gen_range(-spread..spread) } else { 0.0 };
        Duration::from_secs_f64((base + jitter).max(0.001))
    }

    fn should_drop<R: Rng>(&self, rng: &mut R) -> bool {
        self.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.packet_loss_rate
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped_loss: u64,
    pub dropped_offline: u64,
    pub dropped_unroutable: u64,
}

// ============================================================================
// Lock-step Network
// ============================================================================

struct NetworkState {
    config: NetworkConfig,
    rng: ChaCha8Rng,
    /// (deliver_at, send sequence) -> packet.
    in_flight: BTreeMap<(Duration, u64), (Address, Packet)>,
    next_seq: u64,
    offline: HashSet<Address>,
    stats: TrafficStats,
}

/// Latency-queued network shared by all nodes of a lock-step simulation.
pub struct SimNetwork {
    ctx: Arc<SimContext>,
    state: Mutex<NetworkState>,
}

impl SimNetwork {
    pub fn new(config: NetworkConfig, ctx: Arc<SimContext>) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(ctx.seed().rotate_left(17));
        Self {
            ctx,
            state: Mutex::new(NetworkState {
                config,
                rng,
                in_flight: BTreeMap::new(),
                next_seq: 0,
                offline: HashSet::new(),
                stats: TrafficStats::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A sleeping node neither receives nor is reachable; packets addressed
    /// to it are dropped at delivery time.
    pub fn set_offline(&self, address: Address, offline: bool) {
        let mut state = self.lock();
        if offline {
            state.offline.insert(address);
        } else {
            state.offline.remove(&address);
        }
    }

    pub fn is_offline(&self, address: Address) -> bool {
        self.lock().offline.contains(&address)
    }

    pub fn set_packet_loss_rate(&self, rate: f64) {
        self.lock().config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn stats(&self) -> TrafficStats {
        self.lock().stats
    }

    /// Count a packet the driver could not hand to any node.
    pub fn record_unroutable(&self) {
        self.lock().stats.dropped_unroutable += 1;
    }

    /// Remove and return every packet due by `now`, in delivery order.
    /// Packets for offline nodes are dropped here.
    pub fn drain_due(&self, now: Duration) -> Vec<(Address, Packet)> {
        let mut state = self.lock();
        let later = state.in_flight.split_off(&(now + Duration::from_nanos(1), 0));
        let due = std::mem::replace(&mut state.in_flight, later);

        let mut delivered = Vec::with_capacity(due.len());
        for (_, (to, packet)) in due {
            if state.offline.contains(&to) {
                state.stats.dropped_offline += 1;
                trace!(%to, packet_type = ?packet.packet_type(), "dropped for offline node");
                continue;
            }
            state.stats.delivered += 1;
            delivered.push((to, packet));
        }
        delivered
    }
}

impl Transport for SimNetwork {
    fn send(&self, to: Address, packet: Packet) {
        let now = self.ctx.now();
        let mut state = self.lock();
        let state = &mut *state;
        state.stats.sent += 1;
        if state.config.should_drop(&mut state.rng) {
            state.stats.dropped_loss += 1;
            trace!(%to, packet_type = ?packet.packet_type(), "packet lost");
            return;
        }
        let latency = state.config.sample_latency(&mut state.rng);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.in_flight.insert((now + latency, seq), (to, packet));
    }
}

// ============================================================================
// Actor-mode Transport
// ============================================================================

/// Routes bincode frames to per-node channels.
pub struct ChannelTransport {
    routes: StdRwLock<HashMap<Address, mpsc::Sender<Vec<u8>>>>,
    packet_loss_rate: f64,
    rng: Mutex<ChaCha8Rng>,
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped_loss: AtomicU64,
    dropped_unroutable: AtomicU64,
}

impl ChannelTransport {
    pub fn new(packet_loss_rate: f64, seed: u64) -> Self {
        Self {
            routes: StdRwLock::new(HashMap::new()),
            packet_loss_rate: packet_loss_rate.clamp(0.0, 1.0),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped_loss: AtomicU64::new(0),
            dropped_unroutable: AtomicU64::new(0),
        }
    }

    /// Register `address` and return the receiving end of its inbox.
    pub fn attach(&self, address: Address, capacity: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(address, tx);
        }
        rx
    }

    /// Stop routing to `address`. Later sends to it are dropped.
    pub fn detach(&self, address: Address) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(&address);
        }
    }

    pub fn stats(&self) -> TrafficStats {
        TrafficStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_loss: self.dropped_loss.load(Ordering::Relaxed),
            dropped_offline: 0,
            dropped_unroutable: self.dropped_unroutable.load(Ordering::Relaxed),
        }
    }

    fn lost(&self) -> bool {
        if self.packet_loss_rate <= 0.0 {
            return false;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen::<f64>() < self.packet_loss_rate,
            Err(_) => false,
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, to: Address, packet: Packet) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        if self.lost() {
            self.dropped_loss.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let frame = match encode_packet(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%to, error = %e, "failed to encode packet");
                return;
            }
        };
        let route = self.routes.read().ok().and_then(|routes| routes.get(&to).cloned());
        let Some(tx) = route else {
            self.dropped_unroutable.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped_unroutable.fetch_add(1, Ordering::Relaxed);
                trace!(%to, error = %e, "frame dropped");
            }
        }
    }
}

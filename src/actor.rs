//! # Actor-mode Driver
//!
//! Runs every [`Node`] as its own tokio task. The node is owned by the task,
//! so all of its mutation is serialized without locks; the outside world
//! talks to it through a cheap, cloneable [`NodeHandle`].
//!
//! ```text
//! NodeHandle ──cmd──►┐
//!                     │  select! { command | inbound frame | tick }
//! ChannelTransport ──►├──────────────► NodeActor (owns Node)
//!                     │
//! tick interval ─────►┘
//! ```
//!
//! Simulated time keeps flowing through the shared [`SimContext`]; an
//! [`ActorMesh`] advances it from a clock task at a fixed real-time rate.
//! A [`ConfigurationError`](crate::rpc::ConfigurationError) surfacing from
//! `receive` or `tick` stops the actor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::identity::{Address, Contact, NodeId, SimContext};
use crate::messages::decode_packet;
use crate::node::{DeliveredMessage, Node, NodeSnapshot};
use crate::protocols::Transport;
use crate::sim::{SimConfig, ADDRESS_BASE};
use crate::transport::{ChannelTransport, TrafficStats, DEFAULT_CHANNEL_CAPACITY};

/// Commands buffered per actor.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Bootstrap(Address, oneshot::Sender<anyhow::Result<()>>),
    Publish(String, Vec<u8>, oneshot::Sender<anyhow::Result<u64>>),
    Snapshot(oneshot::Sender<NodeSnapshot>),
    DrainMessages(oneshot::Sender<Vec<DeliveredMessage>>),
    Quit,
}

// ============================================================================
// Node Handle
// ============================================================================

#[derive(Clone)]
pub struct NodeHandle {
    contact: Contact,
    cmd_tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    /// Move `node` into a new task fed by `inbound` frames and ticked every
    /// `tick_interval`.
    pub fn spawn(node: Node, inbound: mpsc::Receiver<Vec<u8>>, tick_interval: Duration) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let contact = node.contact();
        let actor = NodeActor { node, tick_interval };
        let task = tokio::spawn(actor.run(cmd_rx, inbound));
        (Self { contact, cmd_tx }, task)
    }

    pub fn contact(&self) -> Contact {
        self.contact
    }

    pub fn id(&self) -> NodeId {
        self.contact.id
    }

    pub fn address(&self) -> Address {
        self.contact.address
    }

    pub async fn bootstrap(&self, seed: Address) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Bootstrap(seed, tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))?
    }

    pub async fn publish(&self, channel: &str, data: Vec<u8>) -> anyhow::Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(channel.to_string(), data, tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))?
    }

    pub async fn snapshot(&self) -> anyhow::Result<NodeSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow!("node actor closed"))
    }

    pub async fn drain_messages(&self) -> Vec<DeliveredMessage> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::DrainMessages(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Node Actor
// ============================================================================

struct NodeActor {
    node: Node,
    tick_interval: Duration,
}

impl NodeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut inbound: mpsc::Receiver<Vec<u8>>) {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Bootstrap(seed, reply)) => {
                            let _ = reply.send(self.node.bootstrap(seed));
                        }
                        Some(Command::Publish(channel, data, reply)) => {
                            let _ = reply.send(self.node.publish(&channel, data));
                        }
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.node.snapshot());
                        }
                        Some(Command::DrainMessages(reply)) => {
                            let _ = reply.send(self.node.drain_messages());
                        }
                        Some(Command::Quit) => {
                            debug!(node = %self.node.id(), "node actor quitting");
                            break;
                        }
                        None => {
                            debug!(node = %self.node.id(), "node handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                frame = inbound.recv() => {
                    let Some(frame) = frame else {
                        debug!(node = %self.node.id(), "inbound channel closed, actor quitting");
                        break;
                    };
                    if let Err(e) = self.on_frame(&frame) {
                        error!(node = %self.node.id(), error = %e, "fatal error handling packet");
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.node.tick() {
                        error!(node = %self.node.id(), error = %e, "fatal error on tick");
                        break;
                    }
                }
            }
        }
    }

    fn on_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        match decode_packet(frame) {
            Ok(packet) => self.node.receive(packet),
            Err(e) => {
                debug!(node = %self.node.id(), error = %e, "malformed frame dropped");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Actor Mesh
// ============================================================================

/// A population of node actors sharing one [`ChannelTransport`].
pub struct ActorMesh {
    ctx: Arc<SimContext>,
    transport: Arc<ChannelTransport>,
    handles: Vec<NodeHandle>,
    tasks: Vec<JoinHandle<()>>,
    clock: JoinHandle<()>,
}

impl ActorMesh {
    /// Spawn `config.node_count` actors and bootstrap each through a random
    /// earlier one. Simulated time advances by `config.step` per real `step`.
    pub async fn spawn(config: &SimConfig) -> anyhow::Result<Self> {
        let ctx = Arc::new(SimContext::new(config.seed));
        let transport = Arc::new(ChannelTransport::new(config.network.packet_loss_rate, config.seed));
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

        let mut handles: Vec<NodeHandle> = Vec::with_capacity(config.node_count);
        let mut tasks = Vec::with_capacity(config.node_count);
        for i in 0..config.node_count as u64 {
            let contact = Contact::new(NodeId(i), Address(ADDRESS_BASE + i));
            let inbound = transport.attach(contact.address, DEFAULT_CHANNEL_CAPACITY);
            let node = Node::new(
                contact,
                ctx.clone(),
                transport.clone() as Arc<dyn Transport>,
                config.node.clone(),
            )?;
            let (handle, task) = NodeHandle::spawn(node, inbound, config.step);
            if let Some(seed) = handles.choose(&mut rng).map(NodeHandle::address) {
                handle.bootstrap(seed).await?;
            }
            handles.push(handle);
            tasks.push(task);
        }
        ctx.set_estimated_network_size(handles.len());

        let step = config.step;
        let clock_ctx = ctx.clone();
        let clock = tokio::spawn(async move {
            let mut interval = tokio::time::interval(step);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                clock_ctx.advance(step);
            }
        });

        info!(nodes = handles.len(), seed = config.seed, "actor mesh spawned");
        Ok(Self { ctx, transport, handles, tasks, clock })
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    pub fn handles(&self) -> &[NodeHandle] {
        &self.handles
    }

    pub fn traffic(&self) -> TrafficStats {
        self.transport.stats()
    }

    /// Snapshots of every live actor; stopped ones are skipped.
    pub async fn snapshots(&self) -> Vec<NodeSnapshot> {
        let mut snapshots = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            if let Ok(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.quit().await;
            self.transport.detach(handle.address());
        }
        for task in self.tasks {
            let _ = task.await;
        }
        self.clock.abort();
        debug!("actor mesh shut down");
    }
}

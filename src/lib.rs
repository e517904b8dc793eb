//! # Swarmlink - Overlay Membership and Messaging for Simulated Swarms
//!
//! Swarmlink lets thousands of simulated nodes find, connect to and message
//! each other using only local, decentralized decisions:
//!
//! - **Routing**: request/response correlation with deadlines over a lossy transport
//! - **Broadcast**: fanout dissemination with bounded de-duplication
//! - **Admission**: score-based connection admission with first-improvement eviction
//! - **Discovery**: epidemic advertisement, bootstrap through a seed, self-healing
//! - **Health**: heartbeats, passive leases and mean-score regression detection
//!
//! ## Architecture
//!
//! Each [`Node`] is a synchronous state machine driven by two entry points,
//! `receive(packet)` and `tick()`. Drivers decide how nodes are scheduled:
//! - [`Simulation`] steps every node in lock-step over a latency-queued network
//! - [`ActorMesh`] gives each node its own tokio task (Handle + Actor), with
//!   packets framed over channels
//!
//! All would-be global state (clock, id generator, network size estimate,
//! RNG seed) lives in an explicit [`SimContext`] passed at construction.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Node ids, addresses, contacts, simulation context |
//! | `messages` | Closed packet union, kinds, headers, framing |
//! | `protocols` | `Transport` collaborator trait |
//! | `rpc` | Packet router: registry, request/response, dispatch |
//! | `peers` | Peer records and the connection table |
//! | `broadcast` | Fanout broadcast and relay de-duplication |
//! | `connecting` | Connection negotiation and admission control |
//! | `discovery` | Discovery gate, acceptance mapping, bootstrap |
//! | `health` | Heartbeats, leases, aggregate health |
//! | `node` | Component wiring and the per-node driver surface |
//! | `transport` | Lock-step and channel transports |
//! | `sim` | Lock-step simulation driver |
//! | `actor` | tokio actor driver |

pub mod actor;
pub mod broadcast;
pub mod connecting;
pub mod discovery;
pub mod health;
pub mod identity;
pub mod messages;
pub mod node;
pub mod peers;
pub mod protocols;
pub mod rpc;
pub mod sim;
pub mod transport;

pub use actor::{ActorMesh, NodeHandle};
pub use identity::{Address, Contact, NodeId, SimContext};
pub use messages::{Packet, PacketType, Payload};
pub use node::{DeliveredMessage, Node, NodeConfig, NodeSnapshot};
pub use protocols::Transport;
pub use rpc::ConfigurationError;
pub use sim::{SimConfig, Simulation, Telemetry};

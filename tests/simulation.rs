//! Integration tests for the lock-step simulation.
//!
//! These tests drive whole populations through the public `Simulation` API
//! and check overlay-level properties: convergence, dissemination, churn and
//! request deadlines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use swarmlink::broadcast::DEFAULT_MAX_RELAY_CYCLES;
use swarmlink::connecting::DEFAULT_MAX_CONNECTIONS;
use swarmlink::health::DEFAULT_PASSIVE_LEASE;
use swarmlink::{Address, Node, Packet, Payload, SimConfig, Simulation};

/// Enough simulated time for several discovery rounds.
const SETTLE: Duration = Duration::from_secs(30);

fn sim(node_count: usize, seed: u64) -> Simulation {
    Simulation::new(SimConfig { node_count, seed, ..Default::default() }).expect("simulation")
}

#[test]
fn overlay_converges() {
    let mut sim = sim(24, 11);
    sim.run_for(SETTLE).expect("run");

    let telemetry = sim.telemetry();
    assert_eq!(telemetry.nodes, 24);
    assert!(telemetry.isolated <= 1, "isolated nodes: {}", telemetry.isolated);
    assert!(telemetry.mean_connections >= 3.0, "mean degree {}", telemetry.mean_connections);
    assert!(telemetry.max_connections <= DEFAULT_MAX_CONNECTIONS);

    for node in sim.nodes() {
        assert!(!node.table().contains(&node.id()), "{} connected to itself", node.id());
        let ids = node.table().ids();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(ids.len(), unique.len(), "{} holds duplicate connections", node.id());
    }
}

#[test]
fn published_message_spreads_without_unbounded_duplicates() {
    let mut sim = sim(16, 5);
    sim.run_for(SETTLE).expect("run");

    let origin = sim
        .nodes()
        .max_by_key(|n| n.table().len())
        .map(Node::address)
        .expect("origin");
    let broadcast_id = sim
        .node_mut(origin)
        .expect("origin")
        .publish("chat", b"hello swarm".to_vec())
        .expect("publish");
    sim.run_for(Duration::from_secs(3)).expect("run");

    let mut reached = 0;
    for address in sim.addresses() {
        let node = sim.node_mut(address).expect("node");
        let copies = node
            .drain_messages()
            .into_iter()
            .filter(|m| m.broadcast_id == Some(broadcast_id))
            .inspect(|m| {
                assert_eq!(m.channel, "chat");
                assert_eq!(m.data, b"hello swarm");
                assert!(m.reply.is_none());
            })
            .count();
        if address == origin {
            assert_eq!(copies, 0, "origin delivered its own broadcast");
            continue;
        }
        assert!(copies <= DEFAULT_MAX_RELAY_CYCLES as usize, "{address} handled {copies} copies");
        if copies > 0 {
            reached += 1;
        }
    }
    assert!(reached >= 8, "broadcast reached only {reached} of 15 peers");
}

#[test]
fn offline_node_is_dropped_by_its_peers() {
    let mut sim = sim(10, 3);
    sim.run_for(SETTLE).expect("run");

    let sleeper = sim
        .nodes()
        .find(|n| !n.table().is_empty())
        .map(Node::address)
        .expect("a connected node");
    let sleeper_id = sim.node(sleeper).map(Node::id).expect("sleeper");
    sim.set_offline(sleeper, true);
    assert!(sim.is_offline(sleeper));

    sim.run_for(DEFAULT_PASSIVE_LEASE + Duration::from_secs(10)).expect("run");
    for node in sim.nodes().filter(|n| n.address() != sleeper) {
        assert!(
            !node.table().contains(&sleeper_id),
            "{} still connected to sleeping {}",
            node.id(),
            sleeper_id
        );
    }
    assert_eq!(sim.telemetry().online, 9);
}

#[test]
fn late_joiner_finds_connections() {
    // Six nodes can never fill an eight-slot table, so the joiner is always admitted.
    let mut sim = sim(6, 8);
    sim.run_for(Duration::from_secs(10)).expect("run");

    let joiner = sim.add_node().expect("join");
    assert_eq!(sim.context().estimated_network_size(), 7);
    sim.run_for(Duration::from_secs(10)).expect("run");

    let node = sim.node(joiner).expect("joiner");
    assert!(!node.table().is_empty(), "joiner {} is isolated", node.id());
    assert!(!node.is_bootstrapping());
}

#[test]
fn request_to_unreachable_node_times_out() {
    let mut sim = sim(4, 2);
    sim.run_for(Duration::from_secs(5)).expect("run");

    let addresses = sim.addresses();
    let (caller, target) = (addresses[0], addresses[1]);
    sim.set_offline(target, true);

    let outcome: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    sim.node_mut(caller)
        .expect("caller")
        .send_application_request(
            target,
            "query",
            vec![1, 2, 3],
            Some(Duration::from_millis(500)),
            Box::new(move |_: &mut Node, response: Option<Packet>| -> anyhow::Result<()> {
                *slot.lock().unwrap() = Some(response.is_some());
                Ok(())
            }),
        )
        .expect("request");

    sim.run_for(Duration::from_millis(400)).expect("run");
    assert_eq!(*outcome.lock().unwrap(), None, "resolved before the deadline");

    sim.run_for(Duration::from_millis(300)).expect("run");
    assert_eq!(*outcome.lock().unwrap(), Some(false));
}

#[test]
fn application_request_is_answered() {
    let mut sim = sim(3, 9);
    sim.run_for(Duration::from_secs(5)).expect("run");

    let addresses = sim.addresses();
    let (caller, callee) = (addresses[0], addresses[2]);

    let reply: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let slot = reply.clone();
    sim.node_mut(caller)
        .expect("caller")
        .send_application_request(
            callee,
            "echo",
            b"ping".to_vec(),
            None,
            Box::new(move |_: &mut Node, response: Option<Packet>| -> anyhow::Result<()> {
                if let Some(Payload::ApplicationReply { data }) = response.map(|p| p.payload) {
                    *slot.lock().unwrap() = Some(data);
                }
                Ok(())
            }),
        )
        .expect("request");
    sim.run_for(Duration::from_millis(200)).expect("run");

    let callee_node = sim.node_mut(callee).expect("callee");
    let delivered: Vec<_> = callee_node
        .drain_messages()
        .into_iter()
        .filter(|m| m.channel == "echo")
        .collect();
    assert_eq!(delivered.len(), 1);
    let token = delivered[0].reply.clone().expect("respondable message carries a token");
    callee_node.reply(&token, b"pong".to_vec()).expect("reply");

    sim.run_for(Duration::from_millis(200)).expect("run");
    assert_eq!(reply.lock().unwrap().as_deref(), Some(&b"pong"[..]));
}

#[test]
fn runs_are_reproducible_under_loss() {
    let run = |seed| {
        let mut config = SimConfig { node_count: 12, seed, ..Default::default() };
        config.network.packet_loss_rate = 0.05;
        let mut sim = Simulation::new(config).expect("simulation");
        sim.run_for(Duration::from_secs(15)).expect("run");
        let topology: HashMap<Address, Vec<_>> =
            sim.nodes().map(|n| (n.address(), n.table().ids())).collect();
        (topology, sim.telemetry().traffic.dropped_loss)
    };
    let (first, lost) = run(17);
    let (second, lost_again) = run(17);
    assert_eq!(first, second);
    assert_eq!(lost, lost_again);
    assert!(lost > 0);
}

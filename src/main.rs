use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use swarmlink::broadcast::BroadcastConfig;
use swarmlink::connecting::ConnectingConfig;
use swarmlink::transport::NetworkConfig;
use swarmlink::{ActorMesh, NodeConfig, NodeSnapshot, SimConfig, Simulation, Telemetry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Deterministic, single-threaded stepping.
    Lockstep,
    /// One tokio task per node, real-time clock.
    Actors,
}

#[derive(Parser, Debug)]
#[command(name = "swarmlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "64")]
    nodes: usize,

    /// Simulated steps to run (lockstep) or seconds to run (actors); 0 runs
    /// until Ctrl+C in actor mode.
    #[arg(short, long, default_value = "3000")]
    steps: u64,

    #[arg(long, default_value = "0")]
    seed: u64,

    #[arg(short, long, default_value = "3")]
    fanout: usize,

    #[arg(short, long, default_value = "8")]
    capacity: usize,

    #[arg(long, default_value = "6")]
    target: usize,

    /// Probability that any single packet is lost.
    #[arg(long, default_value = "0.0")]
    packet_loss: f64,

    /// Share of nodes put to sleep halfway through a lockstep run.
    #[arg(long, default_value = "0.0")]
    offline_fraction: f64,

    #[arg(long, value_enum, default_value = "lockstep")]
    mode: Mode,

    /// Steps (lockstep) or seconds (actors) between telemetry lines.
    #[arg(short, long, default_value = "500")]
    telemetry_interval: u64,
}

impl Args {
    fn sim_config(&self) -> SimConfig {
        SimConfig {
            node_count: self.nodes,
            seed: self.seed,
            network: NetworkConfig { packet_loss_rate: self.packet_loss, ..Default::default() },
            node: NodeConfig {
                broadcast: BroadcastConfig { fanout: self.fanout, ..Default::default() },
                connecting: ConnectingConfig {
                    max_connections: self.capacity,
                    target_connections: self.target.min(self.capacity),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match args.mode {
        Mode::Lockstep => run_lockstep(&args),
        Mode::Actors => run_actors(&args).await,
    }
}

fn run_lockstep(args: &Args) -> Result<()> {
    let mut sim = Simulation::new(args.sim_config())?;
    let interval = args.telemetry_interval.max(1);
    let sleep_at = args.steps / 2;

    for step in 1..=args.steps {
        sim.step()?;

        if step == sleep_at && args.offline_fraction > 0.0 {
            let addresses = sim.addresses();
            let count = (addresses.len() as f64 * args.offline_fraction.clamp(0.0, 1.0)) as usize;
            for address in addresses.into_iter().take(count) {
                sim.set_offline(address, true);
            }
            warn!(count, "nodes put to sleep");
        }
        if step % interval == 0 {
            log_telemetry(&sim.telemetry());
        }
    }

    log_telemetry(&sim.telemetry());
    Ok(())
}

async fn run_actors(args: &Args) -> Result<()> {
    let mesh = ActorMesh::spawn(&args.sim_config()).await?;
    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    let deadline = time::sleep(Duration::from_secs(if args.steps == 0 { u64::MAX / 4 } else { args.steps }));
    tokio::pin!(deadline);

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = &mut deadline => {
                info!("Run complete");
                break;
            }
            _ = interval.tick() => {
                let snapshots = mesh.snapshots().await;
                log_snapshots(&snapshots);
                let traffic = mesh.traffic();
                info!(
                    sent = traffic.sent,
                    delivered = traffic.delivered,
                    lost = traffic.dropped_loss,
                    "traffic"
                );
            }
        }
    }

    mesh.shutdown().await;
    Ok(())
}

fn log_telemetry(t: &Telemetry) {
    info!(
        now_ms = t.now.as_millis() as u64,
        nodes = t.nodes,
        online = t.online,
        isolated = t.isolated,
        min = t.min_connections,
        max = t.max_connections,
        mean = format!("{:.2}", t.mean_connections),
        score = format!("{:.1}", t.mean_score),
        pending = t.pending_requests,
        sent = t.traffic.sent,
        lost = t.traffic.dropped_loss,
        "telemetry snapshot"
    );
}

fn log_snapshots(snapshots: &[NodeSnapshot]) {
    let counts: Vec<usize> = snapshots.iter().map(|s| s.connections.len()).collect();
    let isolated = counts.iter().filter(|&&c| c == 0).count();
    let mean = if counts.is_empty() {
        0.0
    } else {
        counts.iter().sum::<usize>() as f64 / counts.len() as f64
    };
    info!(
        nodes = snapshots.len(),
        isolated,
        min = counts.iter().copied().min().unwrap_or(0),
        max = counts.iter().copied().max().unwrap_or(0),
        mean = format!("{:.2}", mean),
        "telemetry snapshot"
    );
}

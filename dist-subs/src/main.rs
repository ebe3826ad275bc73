use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{info, warn};

use dist_subs::{
    cli::{CapacityArgs, Cli, Command, MonitorArgs, NodeArgs, RegisterArgs, StartArgs},
    config::DistSubsConfig,
    connector::{AdminSession, SubscriberClient},
    membership::ClusterMembership,
    monitor::{self, MonitorOptions},
    node::Node,
    proto::{Response, Subscriber},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = DistSubsConfig::resolve(cli.config.as_deref())?;
    let membership = config.membership()?;

    match cli.command {
        Command::Node(args) => run_node(args, membership).await?,
        Command::Start(args) => start(args, &config, &membership).await?,
        Command::Capacity(args) => capacity(args, &membership).await?,
        Command::Register(args) => register(args, membership).await?,
        Command::Monitor(args) => run_monitor(args, &config, &membership).await?,
    }

    Ok(())
}

async fn run_node(args: NodeArgs, membership: ClusterMembership) -> Result<()> {
    let node = Node::new(args.id, membership)?;
    let addr = node.start().await?;
    info!("node {} admin listening on {}", args.id, addr);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received, stopping node {}", args.id);
            node.stop();
        }
        _ = node.wait_for_shutdown() => {}
    }
    Ok(())
}

async fn start(args: StartArgs, config: &DistSubsConfig, membership: &ClusterMembership) -> Result<()> {
    let level = args.fault_tolerance.unwrap_or(config.fault_tolerance_level);
    let ids = if args.ids.is_empty() {
        membership.ids().to_vec()
    } else {
        args.ids
    };

    let mut refused = 0;
    for id in ids {
        let reply = match AdminSession::connect(membership, id).await {
            Ok(mut session) => session.start(level).await,
            Err(err) => Err(err),
        };
        match reply {
            Ok(message) if message.response() == Response::Yep => println!("node {id}: YEP"),
            Ok(_) => {
                println!("node {id}: NOP");
                refused += 1;
            }
            Err(err) => {
                warn!("node {id} could not be started: {err:#}");
                refused += 1;
            }
        }
    }

    if refused > 0 {
        bail!("{refused} node(s) did not start");
    }
    Ok(())
}

async fn capacity(args: CapacityArgs, membership: &ClusterMembership) -> Result<()> {
    let mut session = AdminSession::connect(membership, args.id).await?;
    let capacity = if args.active {
        session
            .active_capacity()
            .await?
            .ok_or_else(|| anyhow!("node {} sent no capacity", args.id))?
    } else {
        session.total_capacity().await?
    };
    println!(
        "node {}: {} subscribers at {}",
        capacity.server_id, capacity.server_status, capacity.timestamp
    );
    Ok(())
}

/// JSON view of a subscriber with the status spelled out.
#[derive(Serialize)]
struct SubscriberView<'a> {
    node: i32,
    id: i32,
    status: &'static str,
    name_surname: &'a str,
    start_date: i64,
    last_accessed: i64,
    interests: &'a [String],
}

async fn register(args: RegisterArgs, membership: ClusterMembership) -> Result<()> {
    let preferred = match args.id {
        Some(id) => id,
        None => *membership
            .ids()
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| anyhow!("cluster has no members"))?,
    };

    let client = SubscriberClient::new(membership);
    let request = Subscriber::registration(args.name, args.interests);
    let (node, record) = client.register(preferred, &request).await?;

    let view = SubscriberView {
        node,
        id: record.id,
        status: record.status().label(),
        name_surname: &record.name_surname,
        start_date: record.start_date,
        last_accessed: record.last_accessed,
        interests: &record.interests,
    };
    println!("{}", serde_json::to_string(&view)?);
    Ok(())
}

async fn run_monitor(args: MonitorArgs, config: &DistSubsConfig, membership: &ClusterMembership) -> Result<()> {
    let options = MonitorOptions {
        fault_tolerance_level: args.fault_tolerance.unwrap_or(config.fault_tolerance_level),
        interval: Duration::from_secs(args.interval_secs),
        rounds: args.rounds,
        plotter: args.plotter,
    };
    let samples = monitor::run(membership, &options).await?;
    info!("monitor finished after {} samples", samples.len());
    Ok(())
}

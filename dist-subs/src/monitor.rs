//! Starts every member and then polls their total capacity on an interval,
//! optionally streaming each sample to a plotter as a length-prefixed frame.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::connector::AdminSession;
use crate::frame::write_message;
use crate::membership::ClusterMembership;
use crate::proto::{Capacity, Response};

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub fault_tolerance_level: i32,
    pub interval: Duration,
    /// Stop after this many polling rounds; `None` runs until no node is left.
    pub rounds: Option<usize>,
    pub plotter: Option<SocketAddr>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            fault_tolerance_level: 1,
            interval: Duration::from_secs(5),
            rounds: None,
            plotter: None,
        }
    }
}

pub async fn run(membership: &ClusterMembership, options: &MonitorOptions) -> Result<Vec<Capacity>> {
    let mut active = start_members(membership, options.fault_tolerance_level).await;
    info!(active = active.len(), "monitoring started nodes");

    let mut plotter = match options.plotter {
        Some(addr) => connect_plotter(addr).await,
        None => None,
    };

    let mut samples = Vec::new();
    let mut round = 0;
    while !active.is_empty() && options.rounds.is_none_or(|limit| round < limit) {
        if round > 0 {
            tokio::time::sleep(options.interval).await;
        }
        round += 1;

        let mut still_active = Vec::with_capacity(active.len());
        for mut session in active {
            match session.total_capacity().await {
                Ok(capacity) => {
                    info!(
                        node = capacity.server_id,
                        subscribers = capacity.server_status,
                        timestamp = capacity.timestamp,
                        "capacity"
                    );
                    forward(&mut plotter, &capacity).await;
                    samples.push(capacity);
                    still_active.push(session);
                }
                Err(err) => warn!(node = session.node(), error = %err, "dropping node from monitor"),
            }
        }
        active = still_active;
    }

    Ok(samples)
}

async fn start_members(membership: &ClusterMembership, level: i32) -> Vec<AdminSession> {
    let mut started = Vec::new();
    for &node in membership.ids() {
        let mut session = match AdminSession::connect(membership, node).await {
            Ok(session) => session,
            Err(err) => {
                warn!(node, error = %err, "node unreachable");
                continue;
            }
        };
        match session.start(level).await {
            Ok(reply) if reply.response() == Response::Yep => {
                info!(node, fault_tolerance = level, "node started");
                started.push(session);
            }
            Ok(reply) => warn!(node, response = ?reply.response(), "node refused start"),
            Err(err) => warn!(node, error = %err, "start command failed"),
        }
    }
    started
}

async fn connect_plotter(addr: SocketAddr) -> Option<TcpStream> {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            info!(%addr, "connected to plotter");
            Some(stream)
        }
        Err(err) => {
            warn!(%addr, error = %err, "plotter unavailable");
            None
        }
    }
}

async fn forward(plotter: &mut Option<TcpStream>, capacity: &Capacity) {
    let Some(stream) = plotter.as_mut() else {
        return;
    };
    if let Err(err) = write_message(stream, capacity).await {
        warn!(error = %err, "plotter write failed, forwarding disabled");
        *plotter = None;
    }
}

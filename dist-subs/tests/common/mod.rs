//! Shared harness: in-process nodes on per-test port ranges.
#![allow(dead_code)]

use std::time::Duration;

use anyhow::{Result, bail, ensure};
use dist_subs::connector::AdminSession;
use dist_subs::membership::{ClusterMembership, NodeId, PortBases};
use dist_subs::node::Node;
use dist_subs::proto::{Configuration, Response};

pub const WAIT: Duration = Duration::from_secs(5);

/// Three-member table with admin ports at `base + id`, client ports at
/// `base + 100 + id` and peer ports at `base + 200 + id`.
pub fn membership(base: u16) -> ClusterMembership {
    ClusterMembership::with_port_bases(PortBases {
        admin: base,
        client: base + 100,
        peer: base + 200,
    })
    .expect("test membership")
}

pub struct TestCluster {
    pub membership: ClusterMembership,
    nodes: Vec<Node>,
}

impl TestCluster {
    /// Builds the listed members and opens their admin ports.
    pub async fn spawn(base: u16, ids: &[NodeId]) -> Result<Self> {
        let membership = membership(base);
        let mut nodes = Vec::new();
        for &id in ids {
            let node = Node::new(id, membership.clone())?;
            node.start().await?;
            nodes.push(node);
        }
        Ok(Self { membership, nodes })
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes
            .iter()
            .find(|node| node.id() == id)
            .expect("node in cluster")
    }

    /// Sends STRT to each running node in id order over the admin port.
    pub async fn start_all(&self, level: i32) -> Result<()> {
        for node in &self.nodes {
            let mut session = AdminSession::connect(&self.membership, node.id()).await?;
            let reply = session.start(level).await?;
            ensure!(
                reply.response() == Response::Yep,
                "node {} refused to start",
                node.id()
            );
        }
        Ok(())
    }

    /// Sends STRT to one node over its admin port.
    pub async fn start(&self, id: NodeId, level: i32) -> Result<()> {
        let mut session = AdminSession::connect(&self.membership, id).await?;
        let reply = session.start(level).await?;
        ensure!(reply.response() == Response::Yep, "node {id} refused to start");
        Ok(())
    }

    /// Configures and starts every node back to back without yielding, so
    /// all peer ports are bound before any dial runs and each pair ends up
    /// dialing each other.
    pub fn start_together(&self, level: i32) -> Result<()> {
        for node in &self.nodes {
            node.configure(Configuration::start(node.id(), level));
            node.start_services()?;
        }
        Ok(())
    }

    /// Waits until every node holds a link to every other running node.
    pub async fn wait_for_mesh(&self) -> Result<()> {
        let expected = self.nodes.len() - 1;
        eventually("full peer mesh", || {
            self.nodes
                .iter()
                .all(|node| node.connected_peers().len() == expected)
        })
        .await
    }
}

/// Polls `check` until it holds or [`WAIT`] elapses.
pub async fn eventually<F>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    match tokio::time::timeout(WAIT, poll).await {
        Ok(()) => Ok(()),
        Err(_) => bail!("timed out waiting for {what}"),
    }
}

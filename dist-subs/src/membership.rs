use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result, bail, ensure};

pub type NodeId = i32;

/// Port offsets; a node's port is `base + id` on each channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBases {
    pub admin: u16,
    pub client: u16,
    pub peer: u16,
}

impl Default for PortBases {
    fn default() -> Self {
        Self {
            admin: 7000,
            client: 6000,
            peer: 5000,
        }
    }
}

/// Socket addresses of the three channels a node serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAddrs {
    pub admin: SocketAddr,
    pub client: SocketAddr,
    pub peer: SocketAddr,
}

/// Fixed cluster table shared by nodes, clients, and the admin tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMembership {
    host: IpAddr,
    bases: PortBases,
    nodes: Vec<NodeId>,
}

impl ClusterMembership {
    pub fn new(host: IpAddr, bases: PortBases, nodes: Vec<NodeId>) -> Result<Self> {
        ensure!(!nodes.is_empty(), "membership requires at least one node");

        let mut seen = HashSet::new();
        for &id in &nodes {
            ensure!(id > 0, "node id {id} must be positive");
            ensure!(seen.insert(id), "node id {id} listed twice");
            for (channel, base) in [
                ("admin", bases.admin),
                ("client", bases.client),
                ("peer", bases.peer),
            ] {
                if port_for(base, id).is_none() {
                    bail!("{channel} port for node {id} overflows base {base}");
                }
            }
        }

        Ok(Self { host, bases, nodes })
    }

    /// Nodes 1..=3 on loopback with the standard 7000/6000/5000 bases.
    pub fn standard() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bases: PortBases::default(),
            nodes: vec![1, 2, 3],
        }
    }

    /// Standard three-node loopback cluster on custom port bases.
    pub fn with_port_bases(bases: PortBases) -> Result<Self> {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bases, vec![1, 2, 3])
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }

    pub fn addrs(&self, id: NodeId) -> Result<NodeAddrs> {
        ensure!(self.contains(id), "node {id} is not a cluster member");
        let addr = |base| {
            port_for(base, id)
                .map(|port| SocketAddr::new(self.host, port))
                .with_context(|| format!("port for node {id} out of range"))
        };
        Ok(NodeAddrs {
            admin: addr(self.bases.admin)?,
            client: addr(self.bases.client)?,
            peer: addr(self.bases.peer)?,
        })
    }

    /// Every member except `id`, in table order.
    pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes.iter().copied().filter(|peer| *peer != id).collect()
    }
}

fn port_for(base: u16, id: NodeId) -> Option<u16> {
    u16::try_from(id).ok().and_then(|id| base.checked_add(id))
}
